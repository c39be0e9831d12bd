pub mod bootstrap;
pub mod local_queue;
pub mod sentinel;
pub mod submit;
pub mod worker;
