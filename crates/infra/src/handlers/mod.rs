//! Job handlers. Every handler must tolerate being run more than once for
//! the same job.

pub mod escrow_fund;
pub mod notify;

pub use escrow_fund::{EscrowFundError, EscrowFundHandler, EscrowFundSettings};
pub use notify::{Notifier, NotifyError, TracingNotifier};
