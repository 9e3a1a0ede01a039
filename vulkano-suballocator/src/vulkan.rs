// Copyright (c) 2016 The vulkano developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! The [`RawDevice`] implementation on top of [`ash`].

use crate::{
    device::{
        BufferCreateInfo, DeviceProperties, DriverError, HeapBudget, ImageCreateInfo, MemoryHeap,
        MemoryProperties, MemoryRequirements, MemoryType, RawDevice,
    },
    DeviceSize,
};
use ash::vk;
use std::fmt;

/// A Vulkan logical device loaded through `ash`.
///
/// The memory properties of the physical device are queried once, when the `AshDevice` is
/// created. The instance and the device are not destroyed when the `AshDevice` is dropped.
pub struct AshDevice {
    instance: ash::Instance,
    physical_device: vk::PhysicalDevice,
    device: ash::Device,
    memory_properties: MemoryProperties,
    properties: DeviceProperties,
    memory_budget: bool,
}

impl AshDevice {
    /// Wraps a logical device.
    ///
    /// If `memory_budget` is `true`, the heap budgets are queried through
    /// `VK_EXT_memory_budget`.
    ///
    /// # Safety
    ///
    /// - `device` must have been created from `physical_device`, which must belong to
    ///   `instance`.
    /// - `instance` and `device` must outlive the `AshDevice` and everything allocated through
    ///   it.
    /// - If `memory_budget` is `true`, the `VK_EXT_memory_budget` extension must be enabled on
    ///   `device` and `instance` must support Vulkan 1.1.
    pub unsafe fn new(
        instance: ash::Instance,
        physical_device: vk::PhysicalDevice,
        device: ash::Device,
        memory_budget: bool,
    ) -> Self {
        // SAFETY: The caller must ensure that `physical_device` belongs to `instance`.
        let raw_memory_properties =
            unsafe { instance.get_physical_device_memory_properties(physical_device) };
        // SAFETY: Same as above.
        let raw_properties = unsafe { instance.get_physical_device_properties(physical_device) };

        let memory_properties = MemoryProperties {
            memory_types: raw_memory_properties.memory_types
                [..raw_memory_properties.memory_type_count as usize]
                .iter()
                .map(|memory_type| MemoryType {
                    property_flags: memory_type.property_flags,
                    heap_index: memory_type.heap_index,
                })
                .collect(),
            memory_heaps: raw_memory_properties.memory_heaps
                [..raw_memory_properties.memory_heap_count as usize]
                .iter()
                .map(|memory_heap| MemoryHeap {
                    size: memory_heap.size,
                    flags: memory_heap.flags,
                })
                .collect(),
        };

        let properties = DeviceProperties {
            device_type: raw_properties.device_type,
            buffer_image_granularity: raw_properties.limits.buffer_image_granularity,
            non_coherent_atom_size: raw_properties.limits.non_coherent_atom_size,
        };

        AshDevice {
            instance,
            physical_device,
            device,
            memory_properties,
            properties,
            memory_budget,
        }
    }

    /// Returns the instance.
    #[inline]
    pub fn instance(&self) -> &ash::Instance {
        &self.instance
    }

    /// Returns the physical device.
    #[inline]
    pub fn physical_device(&self) -> vk::PhysicalDevice {
        self.physical_device
    }

    /// Returns the logical device.
    #[inline]
    pub fn device(&self) -> &ash::Device {
        &self.device
    }
}

impl fmt::Debug for AshDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AshDevice")
            .field("instance", &self.instance.handle())
            .field("physical_device", &self.physical_device)
            .field("device", &self.device.handle())
            .field("memory_properties", &self.memory_properties)
            .field("properties", &self.properties)
            .field("memory_budget", &self.memory_budget)
            .finish()
    }
}

unsafe impl RawDevice for AshDevice {
    #[inline]
    fn memory_properties(&self) -> MemoryProperties {
        self.memory_properties.clone()
    }

    #[inline]
    fn properties(&self) -> DeviceProperties {
        self.properties
    }

    fn allocate_memory(
        &self,
        allocation_size: DeviceSize,
        memory_type_index: u32,
    ) -> Result<vk::DeviceMemory, DriverError> {
        let allocate_info = vk::MemoryAllocateInfo::default()
            .allocation_size(allocation_size)
            .memory_type_index(memory_type_index);

        // SAFETY: The allocate info is valid, and the memory is freed through `free_memory`.
        unsafe { self.device.allocate_memory(&allocate_info, None) }.map_err(DriverError::from)
    }

    unsafe fn free_memory(&self, memory: vk::DeviceMemory) {
        unsafe { self.device.free_memory(memory, None) };
    }

    fn create_buffer(&self, create_info: &BufferCreateInfo) -> Result<vk::Buffer, DriverError> {
        let create_info_vk = vk::BufferCreateInfo::default()
            .size(create_info.size)
            .usage(create_info.usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        // SAFETY: The create info is valid, and the buffer is destroyed through
        // `destroy_buffer`.
        unsafe { self.device.create_buffer(&create_info_vk, None) }.map_err(DriverError::from)
    }

    fn create_image(&self, create_info: &ImageCreateInfo) -> Result<vk::Image, DriverError> {
        let [width, height, depth] = create_info.extent;
        let create_info_vk = vk::ImageCreateInfo::default()
            .image_type(create_info.image_type)
            .format(create_info.format)
            .extent(vk::Extent3D {
                width,
                height,
                depth,
            })
            .mip_levels(create_info.mip_levels)
            .array_layers(create_info.array_layers)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(create_info.tiling.into())
            .usage(create_info.usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);

        // SAFETY: The create info is valid, and the image is destroyed through `destroy_image`.
        unsafe { self.device.create_image(&create_info_vk, None) }.map_err(DriverError::from)
    }

    unsafe fn buffer_memory_requirements(&self, buffer: vk::Buffer) -> MemoryRequirements {
        let requirements = unsafe { self.device.get_buffer_memory_requirements(buffer) };

        MemoryRequirements {
            size: requirements.size,
            alignment: requirements.alignment,
            memory_type_bits: requirements.memory_type_bits,
        }
    }

    unsafe fn image_memory_requirements(&self, image: vk::Image) -> MemoryRequirements {
        let requirements = unsafe { self.device.get_image_memory_requirements(image) };

        MemoryRequirements {
            size: requirements.size,
            alignment: requirements.alignment,
            memory_type_bits: requirements.memory_type_bits,
        }
    }

    unsafe fn bind_buffer_memory(
        &self,
        buffer: vk::Buffer,
        memory: vk::DeviceMemory,
        offset: DeviceSize,
    ) -> Result<(), DriverError> {
        unsafe { self.device.bind_buffer_memory(buffer, memory, offset) }
            .map_err(DriverError::from)
    }

    unsafe fn bind_image_memory(
        &self,
        image: vk::Image,
        memory: vk::DeviceMemory,
        offset: DeviceSize,
    ) -> Result<(), DriverError> {
        unsafe { self.device.bind_image_memory(image, memory, offset) }.map_err(DriverError::from)
    }

    unsafe fn destroy_buffer(&self, buffer: vk::Buffer) {
        unsafe { self.device.destroy_buffer(buffer, None) };
    }

    unsafe fn destroy_image(&self, image: vk::Image) {
        unsafe { self.device.destroy_image(image, None) };
    }

    fn memory_budget(&self) -> Option<Vec<HeapBudget>> {
        if !self.memory_budget {
            return None;
        }

        let mut budget_properties = vk::PhysicalDeviceMemoryBudgetPropertiesEXT::default();
        let mut memory_properties2 =
            vk::PhysicalDeviceMemoryProperties2::default().push_next(&mut budget_properties);

        // SAFETY: The caller of `new` ensured that Vulkan 1.1 and `VK_EXT_memory_budget` are
        // available.
        unsafe {
            self.instance.get_physical_device_memory_properties2(
                self.physical_device,
                &mut memory_properties2,
            )
        };

        let heap_count = memory_properties2.memory_properties.memory_heap_count as usize;

        Some(
            (0..heap_count)
                .map(|heap_index| HeapBudget {
                    usage: budget_properties.heap_usage[heap_index],
                    budget: budget_properties.heap_budget[heap_index],
                })
                .collect(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{AllocationCreateInfo, MemoryUsage, StandardMemoryAllocator};
    use std::{slice, sync::Arc};

    /// Creates an instance and a device on the first physical device, or returns `None` if there
    /// is no Vulkan implementation on the system.
    fn instance_and_device() -> Option<(ash::Instance, vk::PhysicalDevice, ash::Device)> {
        let entry = unsafe { ash::Entry::load() }.ok()?;
        let application_info = vk::ApplicationInfo::default().api_version(vk::API_VERSION_1_1);
        let instance_create_info =
            vk::InstanceCreateInfo::default().application_info(&application_info);
        let instance = unsafe { entry.create_instance(&instance_create_info, None) }.ok()?;

        let physical_device = match unsafe { instance.enumerate_physical_devices() } {
            Ok(physical_devices) if !physical_devices.is_empty() => physical_devices[0],
            _ => {
                unsafe { instance.destroy_instance(None) };
                return None;
            }
        };

        let queue_priorities = [1.0];
        let queue_create_info = vk::DeviceQueueCreateInfo::default()
            .queue_family_index(0)
            .queue_priorities(&queue_priorities);
        let device_create_info = vk::DeviceCreateInfo::default()
            .queue_create_infos(slice::from_ref(&queue_create_info));

        match unsafe { instance.create_device(physical_device, &device_create_info, None) } {
            Ok(device) => Some((instance, physical_device, device)),
            Err(_) => {
                unsafe { instance.destroy_instance(None) };
                None
            }
        }
    }

    #[test]
    fn reports_memory_properties() {
        let Some((instance, physical_device, device)) = instance_and_device() else {
            return;
        };

        {
            let ash_device =
                unsafe { AshDevice::new(instance.clone(), physical_device, device.clone(), false) };
            let memory_properties = ash_device.memory_properties();

            assert!(!memory_properties.memory_types.is_empty());
            assert!(memory_properties
                .memory_types
                .iter()
                .all(|memory_type| (memory_type.heap_index as usize)
                    < memory_properties.memory_heaps.len()));
            assert!(ash_device.properties().buffer_image_granularity >= 1);
            assert_eq!(ash_device.memory_budget(), None);
        }

        unsafe { device.destroy_device(None) };
        unsafe { instance.destroy_instance(None) };
    }

    #[test]
    fn buffer_round_trip() {
        let Some((instance, physical_device, device)) = instance_and_device() else {
            return;
        };

        {
            let ash_device = Arc::new(unsafe {
                AshDevice::new(instance.clone(), physical_device, device.clone(), false)
            });
            let allocator = StandardMemoryAllocator::new_default(ash_device).unwrap();

            let buffers = [MemoryUsage::GpuOnly, MemoryUsage::CpuToGpu]
                .map(|usage| {
                    allocator
                        .create_buffer(
                            BufferCreateInfo {
                                size: 4096,
                                usage: vk::BufferUsageFlags::TRANSFER_DST,
                                ..Default::default()
                            },
                            AllocationCreateInfo {
                                usage,
                                ..Default::default()
                            },
                        )
                        .unwrap()
                });

            let [gpu_only, cpu_to_gpu] = buffers;
            let host_visible = allocator
                .block_collection(cpu_to_gpu.region().memory_type_index())
                .unwrap()
                .memory_type()
                .property_flags
                .contains(vk::MemoryPropertyFlags::HOST_VISIBLE);
            assert!(host_visible);

            unsafe { allocator.destroy_buffer(gpu_only) };
            unsafe { allocator.destroy_buffer(cpu_to_gpu) };

            assert!(allocator
                .block_collections()
                .iter()
                .all(|pool| pool.block_count() == 0));
        }

        unsafe { device.destroy_device(None) };
        unsafe { instance.destroy_instance(None) };
    }
}
