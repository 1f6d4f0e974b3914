pub mod reference;
pub mod transaction;

pub use reference::{generate_reference, is_valid_reference, REFERENCE_MAX_LEN, REFERENCE_MIN_LEN};
pub use transaction::{
    FailureCode, FulfillmentReceipt, Phase, PurchaseIntent, TransactionRecord, TransitionError,
};
