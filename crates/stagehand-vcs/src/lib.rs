//! # stagehand-vcs
//!
//! Checkout primitives for Stagehand workspaces.
//!
//! This crate provides:
//! - The [`Checkout`] trait: create, remove and prune isolated checkouts
//! - `git worktree` and `jj workspace` implementations
//! - A mock checkout for tests

mod checkout;
mod git;
mod jj;
mod mock;

pub use checkout::{run_command, Checkout, CheckoutOutput};
pub use git::GitWorktree;
pub use jj::JjWorkspace;
pub use mock::MockCheckout;
