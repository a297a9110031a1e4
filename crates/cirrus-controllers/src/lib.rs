//! Cirrus controllers
//!
//! Reconciliation logic for the Ec2NodeClass status (resolver composition
//! and termination), NodeClaim lifecycle (launch and teardown), the
//! instance garbage collector with tag back-fill, and the
//! interruption-queue consumer.

#![deny(missing_docs)]

pub mod gc;
pub mod interruption;
pub mod nodeclaim;
pub mod nodeclass;
