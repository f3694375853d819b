//! GPU resources: memory, descriptors, textures and shared data layouts

pub mod allocator;
pub mod descriptor_set;
pub mod gpu_types;
pub mod staging;
pub mod texture;
pub mod transition;

pub use allocator::{AccelerationAllocation, Allocator, BufferAllocation, ImageAllocation, MemoryUsageClass};
pub use descriptor_set::{DescriptorSetLayoutBuilder, DescriptorSetType, DescriptorWrite, PendingWrite};
pub use staging::StagingQueue;
pub use texture::{ImageView, Sampler, Texture};
