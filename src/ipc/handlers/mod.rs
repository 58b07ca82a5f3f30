pub mod auth;
pub mod backup;
pub mod core;
pub mod imports;
pub mod payments;
pub mod programmes;
pub mod reports;
pub mod students;
pub mod users;
