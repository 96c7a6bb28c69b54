pub mod action;
pub mod load_action;
pub mod manager;
pub mod overwrite;

pub use action::{ActionState, TransactionAction};
pub use load_action::LoadTransactionAction;
pub use manager::{BoxedAction, TransactionManager};
pub use overwrite::{OverwritePlan, overwrite_version_tag};
