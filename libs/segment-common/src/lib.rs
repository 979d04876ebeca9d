pub mod layout;
pub mod types;
pub mod worker;
