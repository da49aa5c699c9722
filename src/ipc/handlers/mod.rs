pub mod core;
pub mod enrollments;
pub mod gpa;
pub mod grades;
pub mod reports;
pub mod scales;
pub mod setup;
