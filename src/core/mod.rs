pub mod collaborators;
pub mod jobs;
pub mod process;
pub mod tasks;
