pub mod approval;
pub mod fulfillment;
pub mod orders;
pub mod payments;
pub mod pricing;
