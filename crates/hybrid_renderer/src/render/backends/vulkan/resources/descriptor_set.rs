//! Descriptor set layouts, pools and writes
//!
//! A [`DescriptorSetType`] bundles one layout, a pool sized for it and every
//! set allocated from that pool. Updates are validated against the layout:
//! each write is built from the binding metadata, and a batch must cover the
//! layout exactly, one write per binding.

use ash::{vk, Device};

use crate::render::backends::vulkan::{VulkanError, VulkanResult};

/// Descriptor set layout builder
#[derive(Default)]
pub struct DescriptorSetLayoutBuilder {
    bindings: Vec<vk::DescriptorSetLayoutBinding>,
}

impl DescriptorSetLayoutBuilder {
    /// Create a new descriptor set layout builder
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a binding of `count` descriptors
    #[must_use]
    pub fn add(mut self, binding: u32, ty: vk::DescriptorType, count: u32, stage_flags: vk::ShaderStageFlags) -> Self {
        self.bindings.push(
            vk::DescriptorSetLayoutBinding::builder()
                .binding(binding)
                .descriptor_type(ty)
                .descriptor_count(count)
                .stage_flags(stage_flags)
                .build(),
        );
        self
    }

    /// Add a single uniform buffer binding
    #[must_use]
    pub fn add_uniform_buffer(self, binding: u32, stage_flags: vk::ShaderStageFlags) -> Self {
        self.add(binding, vk::DescriptorType::UNIFORM_BUFFER, 1, stage_flags)
    }

    /// Add a combined image sampler array
    #[must_use]
    pub fn add_combined_image_sampler(self, binding: u32, count: u32, stage_flags: vk::ShaderStageFlags) -> Self {
        self.add(binding, vk::DescriptorType::COMBINED_IMAGE_SAMPLER, count, stage_flags)
    }

    /// Add a storage buffer array
    #[must_use]
    pub fn add_storage_buffer(self, binding: u32, count: u32, stage_flags: vk::ShaderStageFlags) -> Self {
        self.add(binding, vk::DescriptorType::STORAGE_BUFFER, count, stage_flags)
    }

    /// Bindings added so far
    pub fn bindings(&self) -> &[vk::DescriptorSetLayoutBinding] {
        &self.bindings
    }

    /// Build the descriptor set layout
    pub fn build(self, device: &Device) -> VulkanResult<DescriptorSetLayout> {
        let layout_info = vk::DescriptorSetLayoutCreateInfo::builder().bindings(&self.bindings);

        let layout = unsafe { device.create_descriptor_set_layout(&layout_info, None) }.map_err(VulkanError::Api)?;

        Ok(DescriptorSetLayout {
            layout,
            device: device.clone(),
            bindings: self.bindings,
        })
    }
}

/// Descriptor set layout wrapper with automatic cleanup
pub struct DescriptorSetLayout {
    layout: vk::DescriptorSetLayout,
    device: Device,
    bindings: Vec<vk::DescriptorSetLayoutBinding>,
}

impl DescriptorSetLayout {
    /// Get the Vulkan descriptor set layout handle
    pub const fn handle(&self) -> vk::DescriptorSetLayout {
        self.layout
    }

    /// Get the bindings used in this layout
    pub fn bindings(&self) -> &[vk::DescriptorSetLayoutBinding] {
        &self.bindings
    }
}

impl Drop for DescriptorSetLayout {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_descriptor_set_layout(self.layout, None);
        }
    }
}

/// Pool sizes covering `set_count` sets of `bindings`, one entry per type
pub fn pool_sizes(bindings: &[vk::DescriptorSetLayoutBinding], set_count: u32) -> Vec<vk::DescriptorPoolSize> {
    let mut sizes: Vec<vk::DescriptorPoolSize> = Vec::new();
    for binding in bindings {
        let count = binding.descriptor_count * set_count;
        match sizes.iter_mut().find(|size| size.ty == binding.descriptor_type) {
            Some(size) => size.descriptor_count += count,
            None => sizes.push(vk::DescriptorPoolSize {
                ty: binding.descriptor_type,
                descriptor_count: count,
            }),
        }
    }
    sizes
}

/// Descriptor pool for allocating descriptor sets
pub struct DescriptorPool {
    pool: vk::DescriptorPool,
    device: Device,
}

impl DescriptorPool {
    /// Create a pool holding `max_sets` sets drawn from `sizes`
    pub fn new(device: Device, max_sets: u32, sizes: &[vk::DescriptorPoolSize]) -> VulkanResult<Self> {
        let pool_info = vk::DescriptorPoolCreateInfo::builder()
            .max_sets(max_sets)
            .pool_sizes(sizes);

        let pool = unsafe { device.create_descriptor_pool(&pool_info, None) }.map_err(VulkanError::Api)?;

        Ok(Self { pool, device })
    }

    /// Allocate one set per layout handle
    pub fn allocate_descriptor_sets(&self, layouts: &[vk::DescriptorSetLayout]) -> VulkanResult<Vec<vk::DescriptorSet>> {
        let alloc_info = vk::DescriptorSetAllocateInfo::builder()
            .descriptor_pool(self.pool)
            .set_layouts(layouts);

        unsafe { self.device.allocate_descriptor_sets(&alloc_info) }.map_err(VulkanError::Api)
    }
}

impl Drop for DescriptorPool {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_descriptor_pool(self.pool, None);
        }
    }
}

/// Resource written into a binding
#[derive(Debug, Clone)]
pub enum DescriptorWrite {
    /// Uniform or storage buffers
    Buffer(Vec<vk::DescriptorBufferInfo>),
    /// Sampled or storage images
    Image(Vec<vk::DescriptorImageInfo>),
    /// Top-level acceleration structures
    AccelerationStructure(Vec<vk::AccelerationStructureKHR>),
}

impl DescriptorWrite {
    fn len(&self) -> usize {
        match self {
            Self::Buffer(infos) => infos.len(),
            Self::Image(infos) => infos.len(),
            Self::AccelerationStructure(handles) => handles.len(),
        }
    }

    fn accepts(&self, ty: vk::DescriptorType) -> bool {
        use vk::DescriptorType as T;
        match self {
            Self::Buffer(_) => matches!(
                ty,
                T::UNIFORM_BUFFER | T::UNIFORM_BUFFER_DYNAMIC | T::STORAGE_BUFFER | T::STORAGE_BUFFER_DYNAMIC
            ),
            Self::Image(_) => matches!(
                ty,
                T::COMBINED_IMAGE_SAMPLER | T::SAMPLED_IMAGE | T::STORAGE_IMAGE | T::SAMPLER
            ),
            Self::AccelerationStructure(_) => ty == T::ACCELERATION_STRUCTURE_KHR,
        }
    }
}

/// A write validated against one layout binding
#[derive(Debug, Clone)]
pub struct PendingWrite {
    /// Binding slot
    pub binding: u32,
    /// Descriptor type declared by the layout
    pub descriptor_type: vk::DescriptorType,
    /// First array element written
    pub array_element: u32,
    /// Resources written
    pub resource: DescriptorWrite,
}

/// Build a write for the binding at `binding_index` in `bindings`
pub fn create_write(
    bindings: &[vk::DescriptorSetLayoutBinding],
    binding_index: usize,
    resource: DescriptorWrite,
    array_element: u32,
) -> VulkanResult<PendingWrite> {
    let binding = bindings.get(binding_index).ok_or_else(|| VulkanError::InvalidOperation {
        reason: format!("Binding index {binding_index} outside layout of {} bindings", bindings.len()),
    })?;

    if !resource.accepts(binding.descriptor_type) {
        return Err(VulkanError::InvalidOperation {
            reason: format!(
                "Binding {} is {:?}, which cannot take {:?}",
                binding.binding, binding.descriptor_type, resource
            ),
        });
    }

    let count = resource.len();
    let end = array_element as usize + count;
    if count == 0 || end > binding.descriptor_count as usize {
        return Err(VulkanError::InvalidOperation {
            reason: format!(
                "Binding {} holds {} descriptors; write covers {}..{}",
                binding.binding, binding.descriptor_count, array_element, end
            ),
        });
    }

    Ok(PendingWrite {
        binding: binding.binding,
        descriptor_type: binding.descriptor_type,
        array_element,
        resource,
    })
}

/// A batch must supply exactly one write per layout binding
pub fn check_batch(bindings: &[vk::DescriptorSetLayoutBinding], writes: &[PendingWrite]) -> VulkanResult<()> {
    if writes.len() == bindings.len() {
        Ok(())
    } else {
        Err(VulkanError::DescriptorCountMismatch {
            expected: bindings.len(),
            actual: writes.len(),
        })
    }
}

/// Layout, pool and sets for one descriptor set shape
pub struct DescriptorSetType {
    sets: Vec<vk::DescriptorSet>,
    // Freed after the sets it allocated
    _pool: DescriptorPool,
    layout: DescriptorSetLayout,
    device: Device,
}

impl DescriptorSetType {
    /// Create the layout and allocate `set_count` sets of it
    pub fn new(device: &Device, builder: DescriptorSetLayoutBuilder, set_count: u32) -> VulkanResult<Self> {
        let layout = builder.build(device)?;
        let sizes = pool_sizes(layout.bindings(), set_count);
        let pool = DescriptorPool::new(device.clone(), set_count, &sizes)?;

        let layouts = vec![layout.handle(); set_count as usize];
        let sets = pool.allocate_descriptor_sets(&layouts)?;

        log::debug!(
            "[DESCRIPTOR] Layout with {} bindings, {} sets",
            layout.bindings().len(),
            sets.len()
        );

        Ok(Self {
            sets,
            _pool: pool,
            layout,
            device: device.clone(),
        })
    }

    /// Layout handle
    pub const fn layout(&self) -> vk::DescriptorSetLayout {
        self.layout.handle()
    }

    /// Bindings declared at creation
    pub fn bindings(&self) -> &[vk::DescriptorSetLayoutBinding] {
        self.layout.bindings()
    }

    /// Set `index`, wrapping for per-image arrays
    pub fn set(&self, index: usize) -> vk::DescriptorSet {
        self.sets[index % self.sets.len()]
    }

    /// Build a write for binding `binding_index` of this layout
    pub fn create_write(
        &self,
        binding_index: usize,
        resource: DescriptorWrite,
        array_element: u32,
    ) -> VulkanResult<PendingWrite> {
        create_write(self.bindings(), binding_index, resource, array_element)
    }

    /// Apply `writes` to every set in the bundle
    pub fn update(&self, writes: &[PendingWrite]) -> VulkanResult<()> {
        check_batch(self.bindings(), writes)?;

        for &set in &self.sets {
            let mut acceleration_infos: Vec<vk::WriteDescriptorSetAccelerationStructureKHR> = writes
                .iter()
                .filter_map(|write| match &write.resource {
                    DescriptorWrite::AccelerationStructure(handles) => Some(
                        vk::WriteDescriptorSetAccelerationStructureKHR::builder()
                            .acceleration_structures(handles)
                            .build(),
                    ),
                    _ => None,
                })
                .collect();

            let mut next_acceleration = 0;
            let mut vk_writes = Vec::with_capacity(writes.len());
            for write in writes {
                let builder = vk::WriteDescriptorSet::builder()
                    .dst_set(set)
                    .dst_binding(write.binding)
                    .dst_array_element(write.array_element)
                    .descriptor_type(write.descriptor_type);

                let vk_write = match &write.resource {
                    DescriptorWrite::Buffer(infos) => builder.buffer_info(infos).build(),
                    DescriptorWrite::Image(infos) => builder.image_info(infos).build(),
                    DescriptorWrite::AccelerationStructure(handles) => {
                        let info = &mut acceleration_infos[next_acceleration];
                        next_acceleration += 1;
                        let mut vk_write = builder.push_next(info).build();
                        vk_write.descriptor_count = u32::try_from(handles.len()).unwrap_or(u32::MAX);
                        vk_write
                    }
                };
                vk_writes.push(vk_write);
            }

            unsafe {
                self.device.update_descriptor_sets(&vk_writes, &[]);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scene_bindings(model_count: u32) -> Vec<vk::DescriptorSetLayoutBinding> {
        DescriptorSetLayoutBuilder::new()
            .add(0, vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC, 1, vk::ShaderStageFlags::VERTEX)
            .add_storage_buffer(1, model_count, vk::ShaderStageFlags::FRAGMENT)
            .add_combined_image_sampler(2, 1, vk::ShaderStageFlags::FRAGMENT)
            .bindings()
            .to_vec()
    }

    fn buffers(count: usize) -> DescriptorWrite {
        DescriptorWrite::Buffer(vec![
            vk::DescriptorBufferInfo {
                buffer: vk::Buffer::null(),
                offset: 0,
                range: vk::WHOLE_SIZE,
            };
            count
        ])
    }

    #[test]
    fn test_write_takes_type_from_layout() {
        let bindings = scene_bindings(3);
        let write = create_write(&bindings, 1, buffers(3), 0).unwrap();
        assert_eq!(write.binding, 1);
        assert_eq!(write.descriptor_type, vk::DescriptorType::STORAGE_BUFFER);
    }

    #[test]
    fn test_write_rejects_wrong_kind_and_overflow() {
        let bindings = scene_bindings(3);
        assert!(create_write(&bindings, 2, buffers(1), 0).is_err());
        assert!(create_write(&bindings, 1, buffers(4), 0).is_err());
        assert!(create_write(&bindings, 1, buffers(1), 3).is_err());
        assert!(create_write(&bindings, 1, buffers(0), 0).is_err());
        assert!(create_write(&bindings, 9, buffers(1), 0).is_err());
        assert!(create_write(&bindings, 1, buffers(1), 2).is_ok());
    }

    #[test]
    fn test_batch_must_cover_every_binding() {
        let bindings = scene_bindings(2);
        let write = create_write(&bindings, 0, buffers(1), 0).unwrap();

        match check_batch(&bindings, &[write.clone(), write.clone()]) {
            Err(VulkanError::DescriptorCountMismatch { expected, actual }) => {
                assert_eq!((expected, actual), (3, 2));
            }
            other => panic!("expected count mismatch, got {other:?}"),
        }
        assert!(check_batch(&bindings, &[write.clone(), write.clone(), write]).is_ok());
    }

    #[test]
    fn test_pool_sizes_merge_types_and_scale_by_sets() {
        let bindings = DescriptorSetLayoutBuilder::new()
            .add_storage_buffer(0, 3, vk::ShaderStageFlags::FRAGMENT)
            .add_storage_buffer(1, 2, vk::ShaderStageFlags::FRAGMENT)
            .add_uniform_buffer(2, vk::ShaderStageFlags::VERTEX)
            .bindings()
            .to_vec();

        let sizes = pool_sizes(&bindings, 2);
        assert_eq!(sizes.len(), 2);
        assert_eq!(sizes[0].ty, vk::DescriptorType::STORAGE_BUFFER);
        assert_eq!(sizes[0].descriptor_count, 10);
        assert_eq!(sizes[1].descriptor_count, 2);
    }
}
