//! Atelier credits client SDK.
//!
//! Feature code uses this crate to check and spend a user's credits before
//! running an AI generation.
//!
//! # Example
//!
//! ```no_run
//! use atelier_client::CreditsClient;
//! use atelier_core::UserId;
//!
//! # async fn example(user_id: UserId) -> Result<(), atelier_client::ClientError> {
//! let client = CreditsClient::new("http://atelier-credits:8080", "your-service-api-key")?;
//!
//! if client.has_enough_credits(&user_id, 5).await? {
//!     let result = client.deduct_credits(&user_id, 5, Some("image_generation")).await?;
//!     if result.success {
//!         println!("{} credits left", result.remaining_credits);
//!     }
//! }
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

mod client;
mod error;
mod types;

pub use client::{ClientOptions, CreditsClient};
pub use error::ClientError;
pub use types::*;
