//! fleetsync-client: HTTP client library
//!
//! Typed access to the sync and tunnel routes of a fleetsync daemon, plus a
//! raw JSON call used for agents and notification addresses.
//!
//! # Examples
//!
//! ```no_run
//! use fleetsync_api::Application;
//! use fleetsync_api::requests::{Dst, TransactionPostRequest};
//! use fleetsync_client::HttpClient;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = HttpClient::new("http://localhost:9014")?;
//!
//! let created = client
//!     .create_transaction(&TransactionPostRequest {
//!         dst: Dst::Filter("role=edge".to_string()),
//!         retry: Some(3),
//!         timeout: Some(5),
//!         application: Application::new(),
//!     })
//!     .await?;
//!
//! let view = client.get_transaction(&created.transaction_id).await?;
//! println!("{}: {} ({})", view.transaction_id, view.code, view.message);
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod http;

pub use error::{ClientError, Result};
pub use http::HttpClient;
