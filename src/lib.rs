//! Core library for `ebsmount`, which provisions EBS volumes on the EC2
//! instance it runs on.
//!
//! [`VolumeLifecycleManager`] creates a volume in the instance's zone,
//! attaches it to a free device slot, formats and mounts it, and reverses
//! the sequence on teardown. Failures after the volume exists are
//! compensated so a failed operation does not leave a billed volume behind.
//! The provider is reached through the [`VolumeBackend`] trait, implemented
//! for EC2 by [`Ec2Backend`].

pub mod allocator;
pub mod backend;
pub mod config;
pub mod ec2;
pub mod lifecycle;
pub mod metadata;
pub mod mount;
pub mod poller;
pub mod request;
pub mod server;
pub mod test_support;
pub mod workload;

pub use allocator::{AllocationError, AllocatorPolicy, Attachment, DeviceProbe, FsProbe};
pub use backend::{ClassifyFault, RemoteFault, Volume, VolumeBackend, VolumeState};
pub use config::{ConfigError, EbsmountConfig};
pub use ec2::{Ec2Backend, Ec2BackendError};
pub use lifecycle::{LifecycleError, LifecycleSettings, MountResult, VolumeLifecycleManager};
pub use metadata::{ContextError, ContextResolver, ImdsClient, InstanceContext};
pub use mount::{
    CommandOutput, CommandRunner, LocalMountExecutor, MountError, MountTools,
    ProcessCommandRunner,
};
pub use poller::{PollError, PollPolicy};
pub use request::{
    FilesystemType, MountRequest, UnmountRequest, UnmountTarget, ValidationError, VolumeClass,
    VolumeSpec,
};
pub use server::{ServerError, Transport};
pub use workload::{Workload, WorkloadError};
