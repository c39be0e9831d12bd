pub mod executable;
pub mod rendezvous;
