//! AWS SDK implementations of the capability traits
//!
//! The core never touches the SDK directly; it calls the narrow traits
//! declared next to each consumer. These adapters implement them for
//! pre-built SDK clients, so region, endpoint and credential discovery stay
//! entirely with the caller:
//!
//! ```ignore
//! let config = aws_config::load_defaults(BehaviorVersion::latest()).await;
//! let table = DynamoTable::new(aws_sdk_dynamodb::Client::new(&config));
//! let store = S3Store::new(aws_sdk_s3::Client::new(&config));
//! ```

pub mod dynamo;
pub mod s3;

pub use dynamo::{DynamoTable, RetryPolicy};
pub use s3::S3Store;
