//! External collaborators: payment provider and object storage

pub mod payment;
pub mod sign;
pub mod storage;

pub use payment::{
    HttpPaymentProvider, PaymentError, PaymentIntent, PaymentProvider, RefundResult,
    SignatureError, WebhookEvent, WebhookVerifier,
};
pub use sign::{RequestSigner, EMPTY_PAYLOAD_SHA256};
pub use storage::{ObjectStore, Receipt, S3Store, StorageError};
