//! Container supervision for stdio backends.
//!
//! Runs each stdio backend inside a managed container so the gateway talks
//! HTTP instead of local pipes and crashes stay bounded. The runtime itself
//! is an external collaborator behind [`ContainerRuntime`]; persistence sits
//! behind [`ContainerStateStore`].

mod runtime;
mod store;
mod supervisor;

pub use runtime::{ContainerRuntime, ContainerSpec, ContainerState, DockerCli, RuntimeError};
pub use store::{ContainerSession, ContainerStateStore, ContainerStatus, MemoryStateStore};
pub use supervisor::{ContainerSupervisor, SupervisorConfig};
