//! Client-side ERC-4337 (EntryPoint v0.6) UserOperation pipeline for modular smart
//! accounts: counterfactual addresses, gas estimation, paymaster sponsorship,
//! validation-module signing and bundler dispatch.

pub mod account;
pub mod address;
pub mod bundler;
pub mod calldata;
pub mod chain;
pub mod config;
pub mod dispatch;
pub mod encoding;
pub mod error;
pub mod gas;
pub mod hash;
pub mod modules;
pub mod paymaster;
pub mod rpc;
pub mod types;

pub use account::{AccountParams, BuildOptions, SmartAccount};
pub use error::{AccountError, Result};
pub use types::{Call, InclusionOutcome, UserOperation, UserOperationReceipt, UserOperationRequest};
