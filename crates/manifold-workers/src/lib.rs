pub mod controller;

pub use controller::{worker, Worker, WorkerContext, WorkerController, WorkerError};
