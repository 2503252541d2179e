//! Transactions: ids, states, the fixed-capacity table and the manager that
//! drives begin, update, commit, prepare and abort.

pub mod id;
pub mod manager;
pub mod state;
pub mod table;

pub use id::TransactionId;
pub use manager::{Transaction, TransactionManager};
pub use state::TransactionState;
pub use table::{TransactionEntry, TransactionTable};
