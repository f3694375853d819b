//! Device memory allocation
//!
//! Buffers, images and acceleration structures are allocated through VMA.
//! Every allocation is a move-only owner holding a reference to the VMA
//! allocator and releases its memory when dropped. The allocator has no
//! internal locking; the `Rc` handles keep it on one thread.

use ash::extensions::khr::AccelerationStructure;
use ash::{vk, Device, Instance};
use bytemuck::Pod;
use std::rc::Rc;
use vk_mem::Alloc;

use super::staging::StagingQueue;
use crate::render::backends::vulkan::initialization::PhysicalDeviceInfo;
use crate::render::backends::vulkan::rendering::commands::CommandPool;
use crate::render::backends::vulkan::{VulkanError, VulkanResult};

/// Smallest buffer the allocator creates; empty uploads still get a valid handle
pub const MIN_BUFFER_SIZE: vk::DeviceSize = 16;

/// Where an allocation lives and who writes it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryUsageClass {
    /// Device-local, written by transfers and shaders only
    GpuOnly,
    /// Host-visible, written by the CPU and read by the GPU
    CpuToGpu,
    /// Host-visible, written by the GPU and read back by the CPU
    GpuToCpu,
}

impl MemoryUsageClass {
    /// Whether the CPU may map the allocation
    pub const fn host_visible(self) -> bool {
        !matches!(self, Self::GpuOnly)
    }

    /// Memory property flags the chosen memory type must have
    pub fn required_flags(self) -> vk::MemoryPropertyFlags {
        match self {
            Self::GpuOnly => vk::MemoryPropertyFlags::DEVICE_LOCAL,
            Self::CpuToGpu | Self::GpuToCpu => {
                vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT
            }
        }
    }

    fn allocation_info(self) -> vk_mem::AllocationCreateInfo {
        let (usage, flags) = match self {
            Self::GpuOnly => (vk_mem::MemoryUsage::AutoPreferDevice, vk_mem::AllocationCreateFlags::empty()),
            Self::CpuToGpu => (
                vk_mem::MemoryUsage::Auto,
                vk_mem::AllocationCreateFlags::HOST_ACCESS_SEQUENTIAL_WRITE,
            ),
            Self::GpuToCpu => (
                vk_mem::MemoryUsage::AutoPreferHost,
                vk_mem::AllocationCreateFlags::HOST_ACCESS_RANDOM,
            ),
        };
        vk_mem::AllocationCreateInfo {
            usage,
            flags,
            required_flags: self.required_flags(),
            ..Default::default()
        }
    }
}

/// Index of the first memory type allowed by `type_bits` that has `required`
pub fn find_memory_type(
    properties: &vk::PhysicalDeviceMemoryProperties,
    type_bits: u32,
    required: vk::MemoryPropertyFlags,
) -> VulkanResult<u32> {
    (0..properties.memory_type_count)
        .find(|&i| {
            type_bits & (1 << i) != 0
                && properties.memory_types[i as usize]
                    .property_flags
                    .contains(required)
        })
        .ok_or(VulkanError::NoSuitableMemoryType)
}

/// Decode bytes read back from the GPU into typed elements
pub fn decode_readback<T: Pod>(bytes: &[u8]) -> VulkanResult<Vec<T>> {
    let element = std::mem::size_of::<T>();
    if element == 0 || bytes.len() % element != 0 {
        return Err(VulkanError::InvalidOperation {
            reason: format!("Readback of {} bytes is not a whole number of {element}-byte elements", bytes.len()),
        });
    }
    Ok(bytemuck::pod_collect_to_vec(bytes))
}

/// Allocated size for a buffer holding `len` bytes
pub fn allocation_size(len: vk::DeviceSize) -> vk::DeviceSize {
    len.max(MIN_BUFFER_SIZE)
}

/// Copy region covering the first `len` bytes, or `None` when there is nothing to copy
pub fn copy_region(len: vk::DeviceSize) -> Option<vk::BufferCopy> {
    (len > 0).then_some(vk::BufferCopy {
        src_offset: 0,
        dst_offset: 0,
        size: len,
    })
}

/// Memory type mask for acceleration structure storage
///
/// Picks the first device-local type among those the backing buffer allows.
pub fn acceleration_memory_type_bits(
    properties: &vk::PhysicalDeviceMemoryProperties,
    requirements: &vk::MemoryRequirements,
) -> VulkanResult<u32> {
    let memory_type = find_memory_type(
        properties,
        requirements.memory_type_bits,
        vk::MemoryPropertyFlags::DEVICE_LOCAL,
    )?;
    Ok(1 << memory_type)
}

fn allocation_error(result: vk::Result, requested: vk::DeviceSize) -> VulkanError {
    match result {
        vk::Result::ERROR_OUT_OF_DEVICE_MEMORY | vk::Result::ERROR_OUT_OF_HOST_MEMORY => VulkanError::OutOfMemory {
            requested: usize::try_from(requested).unwrap_or(usize::MAX),
        },
        other => VulkanError::Api(other),
    }
}

fn to_usize(value: vk::DeviceSize) -> VulkanResult<usize> {
    usize::try_from(value).map_err(|_| VulkanError::InvalidOperation {
        reason: format!("Size {value} does not fit in host memory"),
    })
}

/// Buffer plus its memory
pub struct BufferAllocation {
    allocator: Rc<vk_mem::Allocator>,
    buffer: vk::Buffer,
    allocation: vk_mem::Allocation,
    size: vk::DeviceSize,
    len: vk::DeviceSize,
    class: MemoryUsageClass,
}

impl BufferAllocation {
    /// Buffer handle
    pub const fn handle(&self) -> vk::Buffer {
        self.buffer
    }

    /// Allocated size in bytes, never below [`MIN_BUFFER_SIZE`]
    pub const fn size(&self) -> vk::DeviceSize {
        self.size
    }

    /// Number of bytes requested at creation
    pub const fn len(&self) -> vk::DeviceSize {
        self.len
    }

    /// Whether the buffer was requested with zero bytes
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Memory usage class the buffer was created with
    pub const fn class(&self) -> MemoryUsageClass {
        self.class
    }

    /// Copy `data` into a host-visible buffer at byte `offset`
    pub fn write<T: Pod>(&mut self, offset: vk::DeviceSize, data: &[T]) -> VulkanResult<()> {
        let bytes: &[u8] = bytemuck::cast_slice(data);
        self.check_host_range(offset, bytes.len())?;
        let offset = to_usize(offset)?;

        unsafe {
            let mapped = self
                .allocator
                .map_memory(&mut self.allocation)
                .map_err(VulkanError::Api)?;
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), mapped.add(offset), bytes.len());
            self.allocator.unmap_memory(&mut self.allocation);
        }
        Ok(())
    }

    /// Copy the requested bytes of a host-visible buffer out
    pub fn read_bytes(&mut self) -> VulkanResult<Vec<u8>> {
        let len = to_usize(self.len)?;
        if len == 0 {
            return Ok(Vec::new());
        }
        self.check_host_range(0, len)?;

        unsafe {
            let mapped = self
                .allocator
                .map_memory(&mut self.allocation)
                .map_err(VulkanError::Api)?;
            let bytes = std::slice::from_raw_parts(mapped, len).to_vec();
            self.allocator.unmap_memory(&mut self.allocation);
            Ok(bytes)
        }
    }

    /// GPU virtual address; the buffer needs `SHADER_DEVICE_ADDRESS` usage
    pub fn device_address(&self, device: &Device) -> vk::DeviceAddress {
        let info = vk::BufferDeviceAddressInfo::builder().buffer(self.buffer);
        unsafe { device.get_buffer_device_address(&info) }
    }

    fn check_host_range(&self, offset: vk::DeviceSize, len: usize) -> VulkanResult<()> {
        if !self.class.host_visible() {
            return Err(VulkanError::InvalidOperation {
                reason: "Buffer is not host visible".to_string(),
            });
        }
        let end = offset.saturating_add(len as vk::DeviceSize);
        if end > self.size {
            return Err(VulkanError::InvalidOperation {
                reason: format!("Write of {len} bytes at {offset} overruns {}-byte buffer", self.size),
            });
        }
        Ok(())
    }
}

impl Drop for BufferAllocation {
    fn drop(&mut self) {
        unsafe {
            self.allocator.destroy_buffer(self.buffer, &mut self.allocation);
        }
    }
}

/// Image plus its memory
pub struct ImageAllocation {
    allocator: Rc<vk_mem::Allocator>,
    image: vk::Image,
    allocation: vk_mem::Allocation,
    extent: vk::Extent2D,
    format: vk::Format,
}

impl ImageAllocation {
    /// Image handle
    pub const fn handle(&self) -> vk::Image {
        self.image
    }

    /// Extent in pixels
    pub const fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    /// Pixel format
    pub const fn format(&self) -> vk::Format {
        self.format
    }
}

impl Drop for ImageAllocation {
    fn drop(&mut self) {
        unsafe {
            self.allocator.destroy_image(self.image, &mut self.allocation);
        }
    }
}

/// Acceleration structure and the buffer backing it
pub struct AccelerationAllocation {
    loader: AccelerationStructure,
    handle: vk::AccelerationStructureKHR,
    device_address: vk::DeviceAddress,
    // Dropped after the structure is destroyed in `Drop::drop`
    _buffer: BufferAllocation,
}

impl AccelerationAllocation {
    /// Acceleration structure handle
    pub const fn handle(&self) -> vk::AccelerationStructureKHR {
        self.handle
    }

    /// Device address referenced by TLAS instance records
    pub const fn device_address(&self) -> vk::DeviceAddress {
        self.device_address
    }
}

impl Drop for AccelerationAllocation {
    fn drop(&mut self) {
        unsafe {
            self.loader.destroy_acceleration_structure(self.handle, None);
        }
    }
}

/// Owner of the VMA allocator and the staging queue
pub struct Allocator {
    staging: StagingQueue<BufferAllocation>,
    vma: Rc<vk_mem::Allocator>,
    device: Device,
    acceleration_loader: AccelerationStructure,
    memory_properties: vk::PhysicalDeviceMemoryProperties,
}

impl Allocator {
    /// Create the allocator for a device with buffer device addresses enabled
    pub fn new(
        instance: &Instance,
        device: &Device,
        physical_device: &PhysicalDeviceInfo,
        acceleration_loader: AccelerationStructure,
    ) -> VulkanResult<Self> {
        let create_info = vk_mem::AllocatorCreateInfo::new(instance, device, physical_device.device)
            .flags(vk_mem::AllocatorCreateFlags::BUFFER_DEVICE_ADDRESS)
            .vulkan_api_version(vk::API_VERSION_1_2);

        let vma = vk_mem::Allocator::new(create_info).map_err(VulkanError::Api)?;
        log::info!("[ALLOC] Memory allocator initialized");

        Ok(Self {
            staging: StagingQueue::new(),
            vma: Rc::new(vma),
            device: device.clone(),
            acceleration_loader,
            memory_properties: physical_device.memory_properties,
        })
    }

    /// Create a buffer of `size` bytes
    pub fn create_buffer(
        &self,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        class: MemoryUsageClass,
    ) -> VulkanResult<BufferAllocation> {
        self.create_buffer_with(size, usage, class.allocation_info(), class)
    }

    fn create_buffer_with(
        &self,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        allocation_info: vk_mem::AllocationCreateInfo,
        class: MemoryUsageClass,
    ) -> VulkanResult<BufferAllocation> {
        let len = size;
        let size = allocation_size(len);
        let buffer_info = vk::BufferCreateInfo::builder()
            .size(size)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let (buffer, allocation) = unsafe {
            self.vma
                .create_buffer(&buffer_info, &allocation_info)
                .map_err(|e| allocation_error(e, size))?
        };
        log::trace!("[ALLOC] Buffer {} bytes {:?} {:?}", size, usage, class);

        Ok(BufferAllocation {
            allocator: Rc::clone(&self.vma),
            buffer,
            allocation,
            size,
            len,
            class,
        })
    }

    /// Create a single-mip 2D image in UNDEFINED layout
    #[allow(clippy::too_many_arguments)]
    pub fn create_image(
        &self,
        extent: vk::Extent2D,
        samples: vk::SampleCountFlags,
        format: vk::Format,
        tiling: vk::ImageTiling,
        usage: vk::ImageUsageFlags,
        class: MemoryUsageClass,
    ) -> VulkanResult<ImageAllocation> {
        let image_info = vk::ImageCreateInfo::builder()
            .image_type(vk::ImageType::TYPE_2D)
            .format(format)
            .extent(vk::Extent3D {
                width: extent.width,
                height: extent.height,
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(1)
            .samples(samples)
            .tiling(tiling)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);

        let requested = vk::DeviceSize::from(extent.width) * vk::DeviceSize::from(extent.height);
        let (image, allocation) = unsafe {
            self.vma
                .create_image(&image_info, &class.allocation_info())
                .map_err(|e| allocation_error(e, requested))?
        };

        Ok(ImageAllocation {
            allocator: Rc::clone(&self.vma),
            image,
            allocation,
            extent,
            format,
        })
    }

    /// Host-visible buffer initialized with `data`
    pub fn create_host_buffer<T: Pod>(&self, data: &[T], usage: vk::BufferUsageFlags) -> VulkanResult<BufferAllocation> {
        let bytes: &[u8] = bytemuck::cast_slice(data);
        let mut buffer = self.create_buffer(bytes.len() as vk::DeviceSize, usage, MemoryUsageClass::CpuToGpu)?;
        buffer.write(0, bytes)?;
        Ok(buffer)
    }

    /// Upload `data` into a device-local buffer through a staging copy
    ///
    /// The copy is recorded into `command_buffer`; the staging buffer is
    /// queued and released by [`Allocator::flush_staging`].
    pub fn create_device_local_buffer<T: Pod>(
        &mut self,
        command_buffer: vk::CommandBuffer,
        data: &[T],
        usage: vk::BufferUsageFlags,
    ) -> VulkanResult<BufferAllocation> {
        let bytes: &[u8] = bytemuck::cast_slice(data);
        let size = bytes.len() as vk::DeviceSize;

        let device_buffer = self.create_buffer(
            size,
            usage | vk::BufferUsageFlags::TRANSFER_DST | vk::BufferUsageFlags::TRANSFER_SRC,
            MemoryUsageClass::GpuOnly,
        )?;

        if let Some(region) = copy_region(size) {
            let staging = self.create_host_buffer(bytes, vk::BufferUsageFlags::TRANSFER_SRC)?;
            unsafe {
                self.device
                    .cmd_copy_buffer(command_buffer, staging.handle(), device_buffer.handle(), &[region]);
            }
            self.staging.push(staging);
        }

        Ok(device_buffer)
    }

    /// Queue a host buffer whose contents a pending command buffer still reads
    pub fn defer_release(&mut self, buffer: BufferAllocation) {
        self.staging.push(buffer);
    }

    /// Release every queued staging buffer. The GPU must be done with them.
    pub fn flush_staging(&mut self) -> usize {
        self.staging.flush()
    }

    /// Allocate backing storage and create an acceleration structure
    ///
    /// The storage buffer is restricted to the first device-local memory
    /// type its memory requirements allow.
    pub fn create_acceleration(
        &self,
        ty: vk::AccelerationStructureTypeKHR,
        size: vk::DeviceSize,
    ) -> VulkanResult<AccelerationAllocation> {
        let usage =
            vk::BufferUsageFlags::ACCELERATION_STRUCTURE_STORAGE_KHR | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS;
        let requirements = self.buffer_requirements(allocation_size(size), usage)?;
        let allocation_info = vk_mem::AllocationCreateInfo {
            memory_type_bits: acceleration_memory_type_bits(&self.memory_properties, &requirements)?,
            ..MemoryUsageClass::GpuOnly.allocation_info()
        };

        let buffer = self.create_buffer_with(size, usage, allocation_info, MemoryUsageClass::GpuOnly)?;

        let create_info = vk::AccelerationStructureCreateInfoKHR::builder()
            .buffer(buffer.handle())
            .offset(0)
            .size(size)
            .ty(ty);

        let handle = unsafe {
            self.acceleration_loader
                .create_acceleration_structure(&create_info, None)
                .map_err(VulkanError::Api)?
        };

        let address_info = vk::AccelerationStructureDeviceAddressInfoKHR::builder().acceleration_structure(handle);
        let device_address = unsafe {
            self.acceleration_loader
                .get_acceleration_structure_device_address(&address_info)
        };

        log::debug!("[ALLOC] Acceleration structure {:?}, {} bytes", ty, size);

        Ok(AccelerationAllocation {
            loader: self.acceleration_loader.clone(),
            handle,
            device_address,
            _buffer: buffer,
        })
    }

    /// Copy the requested bytes of a device buffer into host memory
    pub fn read_back(
        &self,
        commands: &CommandPool,
        queue: vk::Queue,
        source: &BufferAllocation,
    ) -> VulkanResult<Vec<u8>> {
        let Some(region) = copy_region(source.len()) else {
            return Ok(Vec::new());
        };
        let mut readback = self.create_buffer(
            source.len(),
            vk::BufferUsageFlags::TRANSFER_DST,
            MemoryUsageClass::GpuToCpu,
        )?;

        commands.run_single_time(queue, |command_buffer| {
            unsafe {
                self.device
                    .cmd_copy_buffer(command_buffer, source.handle(), readback.handle(), &[region]);
            }
            Ok(())
        })?;

        readback.read_bytes()
    }

    // Requirements of a buffer with this size and usage, from a throwaway handle
    fn buffer_requirements(
        &self,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
    ) -> VulkanResult<vk::MemoryRequirements> {
        let buffer_info = vk::BufferCreateInfo::builder()
            .size(size)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        unsafe {
            let buffer = self
                .device
                .create_buffer(&buffer_info, None)
                .map_err(VulkanError::Api)?;
            let requirements = self.device.get_buffer_memory_requirements(buffer);
            self.device.destroy_buffer(buffer, None);
            Ok(requirements)
        }
    }

    /// Device memory heaps and types
    pub const fn memory_properties(&self) -> &vk::PhysicalDeviceMemoryProperties {
        &self.memory_properties
    }

    /// Logical device the allocator was created for
    pub const fn device(&self) -> &Device {
        &self.device
    }
}

impl Drop for Allocator {
    fn drop(&mut self) {
        unsafe {
            let _ = self.device.device_wait_idle();
        }
        self.staging.flush();
        if Rc::strong_count(&self.vma) > 1 {
            log::warn!(
                "[ALLOC] {} allocations outlive the allocator",
                Rc::strong_count(&self.vma) - 1
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::scene::Vertex;

    fn memory_properties(flags: &[vk::MemoryPropertyFlags]) -> vk::PhysicalDeviceMemoryProperties {
        let mut properties = vk::PhysicalDeviceMemoryProperties::default();
        properties.memory_type_count = u32::try_from(flags.len()).unwrap();
        for (i, &property_flags) in flags.iter().enumerate() {
            properties.memory_types[i] = vk::MemoryType {
                property_flags,
                heap_index: 0,
            };
        }
        properties
    }

    #[test]
    fn test_find_memory_type_respects_type_bits_and_flags() {
        let properties = memory_properties(&[
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
            vk::MemoryPropertyFlags::DEVICE_LOCAL | vk::MemoryPropertyFlags::HOST_VISIBLE,
        ]);

        let local = vk::MemoryPropertyFlags::DEVICE_LOCAL;
        assert_eq!(find_memory_type(&properties, u32::MAX, local).unwrap(), 1);
        assert_eq!(find_memory_type(&properties, 0b100, local).unwrap(), 2);
        assert!(matches!(
            find_memory_type(&properties, 0b001, local),
            Err(VulkanError::NoSuitableMemoryType)
        ));
    }

    #[test]
    fn test_usage_classes_map_to_required_flags() {
        assert!(!MemoryUsageClass::GpuOnly.host_visible());
        assert!(MemoryUsageClass::CpuToGpu.host_visible());
        assert!(MemoryUsageClass::GpuToCpu
            .required_flags()
            .contains(vk::MemoryPropertyFlags::HOST_COHERENT));
        assert_eq!(MemoryUsageClass::GpuOnly.required_flags(), vk::MemoryPropertyFlags::DEVICE_LOCAL);
    }

    #[test]
    fn test_upload_bytes_decode_back_identically() {
        let vertices = vec![
            Vertex::new([1.0, 2.0, 3.0], [0.0, 1.0, 0.0], [0.25, 0.75]),
            Vertex {
                material_id: 2,
                ..Vertex::new([-1.0, 0.5, 8.0], [1.0, 0.0, 0.0], [1.0, 0.0])
            },
        ];
        let uploaded: &[u8] = bytemuck::cast_slice(&vertices);
        assert_eq!(uploaded.len(), 2 * 48);

        let decoded: Vec<Vertex> = decode_readback(uploaded).unwrap();
        assert_eq!(decoded, vertices);
        assert_eq!(bytemuck::cast_slice::<Vertex, u8>(&decoded), uploaded);
    }

    #[test]
    fn test_acceleration_memory_follows_buffer_requirements() {
        let local = vk::MemoryPropertyFlags::DEVICE_LOCAL;
        let properties = memory_properties(&[local, vk::MemoryPropertyFlags::HOST_VISIBLE, local]);
        let requirements = vk::MemoryRequirements {
            size: 256,
            alignment: 256,
            memory_type_bits: 0b110,
        };

        assert_eq!(acceleration_memory_type_bits(&properties, &requirements).unwrap(), 0b100);

        let host_only = vk::MemoryRequirements {
            memory_type_bits: 0b010,
            ..requirements
        };
        assert!(matches!(
            acceleration_memory_type_bits(&properties, &host_only),
            Err(VulkanError::NoSuitableMemoryType)
        ));
    }

    #[test]
    fn test_small_upload_reads_back_at_requested_length() {
        let data = [1u32, 2, 3];
        let bytes: &[u8] = bytemuck::cast_slice(&data);
        let len = bytes.len() as vk::DeviceSize;

        assert_eq!(allocation_size(len), MIN_BUFFER_SIZE);
        let region = copy_region(len).unwrap();
        assert_eq!(region.size, 12);

        let copied = &bytes[..usize::try_from(region.size).unwrap()];
        assert_eq!(decode_readback::<u32>(copied).unwrap(), data);
        assert!(copy_region(0).is_none());
        assert_eq!(allocation_size(0), MIN_BUFFER_SIZE);
    }

    #[test]
    fn test_partial_readback_is_rejected() {
        let bytes = [0u8; 10];
        assert!(decode_readback::<u32>(&bytes).is_err());
    }

    #[test]
    fn test_out_of_memory_results_are_classified() {
        assert!(matches!(
            allocation_error(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY, 64),
            VulkanError::OutOfMemory { requested: 64 }
        ));
        assert!(matches!(
            allocation_error(vk::Result::ERROR_INITIALIZATION_FAILED, 64),
            VulkanError::Api(vk::Result::ERROR_INITIALIZATION_FAILED)
        ));
    }
}
