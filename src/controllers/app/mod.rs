pub mod controller;

pub use controller::{run, AppReconciler, Settings};

mod reconcilers;
pub use reconcilers::replicas::{PodReplicas, Replica, ReplicaBackend};
