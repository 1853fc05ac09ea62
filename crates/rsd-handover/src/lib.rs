//! rsd-handover
//!
//! Delegated transfer of the syndic role for one residence.
//!
//! The current syndic issues a single-use, expiring, attempt-limited access
//! code naming a replacement email. The replacement redeems it; residence
//! data is re-pointed, roles are swapped, the former syndic's subscriptions
//! are cancelled and the code is consumed. Three failed guesses against a
//! code invalidate it and delete the account that made the third guess.
//!
//! Entry point: [`Coordinator`]. Storage, account directory and payment
//! gateway are reached through the traits in [`ports`].

pub mod attempts;
pub mod code_store;
pub mod coordinator;
pub mod error;
pub mod events;
pub mod ports;
pub mod remediation;
pub mod settings;
pub mod transfer;
pub mod types;
pub mod validator;

pub use code_store::{generate_code, normalize_email, IssuedCode, CODE_ALPHABET};
pub use coordinator::{
    CompletionPath, CompletionReport, Coordinator, HandoverDeps, SubscriptionSweep,
};
pub use error::{HandoverError, HandoverResult, PartialTransfer, RejectReason, Rejection};
pub use events::{code_fingerprint, HandoverEvent};
pub use ports::{
    AccountDirectory, AuditSink, ClaimBinding, Clock, CodeRepository, MarkUsed, NoopAudit,
    OwnershipStore, PaymentGateway, SystemClock, TransferLease,
};
pub use remediation::RemediationOutcome;
pub use settings::HandoverSettings;
pub use transfer::{CategoryStep, OwnershipTransferEngine, TransferReport};
pub use types::{
    AccessCode, Account, AccountId, ActionType, CodeStatus, OwnershipCategory, ResidenceId,
    Role, SubscriptionId, TransferPhase, VerifiedIdentity, MAX_FAILED_ATTEMPTS,
};
pub use validator::{UserValidation, Validation};
