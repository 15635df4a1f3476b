//! Units of protocol work
//!
//! Tasks are plain data. The engine interprets them in order against a
//! draft of the trade; the draft is committed only if every task succeeds.

use crate::message::MessageKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Task {
    Send(SendTask),
    Process(ProcessTask),
}

/// Build, sign and transmit a message to the counterparty
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendTask {
    pub kind: MessageKind,
    /// Arm the response deadline once sent
    pub await_reply: bool,
}

/// Verify-then-mutate step, or a local step that fills the model
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessTask {
    /// Verify the inbound message, then apply it
    Verify(MessageKind),
    SignContract,
    RecordAccountData,
    ReserveAddress,
    PrepareKeyShares,
    SignPartials,
    SignDeposit,
    PublishDeposit,
    SignPayout,
    PublishPayout,
    CreateInvoice,
    LockHtlc,
}

impl Task {
    pub fn send(kind: MessageKind) -> Self {
        Task::Send(SendTask {
            kind,
            await_reply: false,
        })
    }

    pub fn send_awaiting(kind: MessageKind) -> Self {
        Task::Send(SendTask {
            kind,
            await_reply: true,
        })
    }

    pub fn verify(kind: MessageKind) -> Self {
        Task::Process(ProcessTask::Verify(kind))
    }

    pub fn process(task: ProcessTask) -> Self {
        Task::Process(task)
    }
}
