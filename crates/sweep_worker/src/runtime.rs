pub use sweep_core::{contract, error, sharding, supervision, workspace};
