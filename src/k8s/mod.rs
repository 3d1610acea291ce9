pub mod client;
pub mod lease;
pub mod types;

pub use client::{K8sClient, LogLines, API_TIMEOUT};
pub use lease::{LeaderElector, LeaderFlag};
pub use types::PodInfo;
