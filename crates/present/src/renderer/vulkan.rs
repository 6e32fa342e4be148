use core::{ffi::c_void, ptr, slice};
use std::collections::HashMap;

use anyhow::{Context, bail};
use ash::{
    khr,
    vk::{self, Handle},
};
use nohash_hasher::BuildNoHashHasher;
use tracing::{debug, trace};

use super::{Release, RenderDriver};
use crate::{
    backend::vulkan::{self as capture, loader, loader_symbol},
    frame::{Frame, NativeTarget},
    image::NativeTexture,
    module::ModuleIntrospection,
    types::Api,
};

/// Objects of one swap chain image.
struct ImageTarget {
    view: vk::ImageView,
    image: vk::Image,
    command_buffer: vk::CommandBuffer,
    /// Signaled when the overlay commands of this image finished.
    fence: vk::Fence,
    /// Waited by the present instead of the host semaphores.
    semaphore: vk::Semaphore,
}

struct SwapchainTargets {
    swapchain: vk::SwapchainKHR,
    extent: vk::Extent2D,
    images: Vec<ImageTarget>,
}

pub struct VulkanDriver {
    device: ash::Device,
    swapchain_fn: khr::swapchain::DeviceFn,
    memory_properties: vk::PhysicalDeviceMemoryProperties,
    queue: vk::Queue,
    command_pool: vk::CommandPool,
    upload_fence: vk::Fence,
    targets: Option<SwapchainTargets>,
    /// Memory of each texture image.
    textures: HashMap<u64, vk::DeviceMemory, BuildNoHashHasher<u64>>,
}

impl VulkanDriver {
    #[tracing::instrument(skip(modules))]
    pub fn new(queue: vk::Queue, modules: &dyn ModuleIntrospection) -> anyhow::Result<Self> {
        let queue_info = capture::queue_info(queue).context("queue was not captured")?;
        let device_info =
            capture::device_info(queue_info.device).context("device was not captured")?;

        let loader = loader(modules)?;
        let get_device_proc_addr = unsafe {
            loader_symbol(modules, loader, c"vkGetDeviceProcAddr")?
                .cast::<vk::PFN_vkGetDeviceProcAddr>()
        };
        let get_memory_properties = unsafe {
            loader_symbol(modules, loader, c"vkGetPhysicalDeviceMemoryProperties")?
                .cast::<vk::PFN_vkGetPhysicalDeviceMemoryProperties>()
        };

        let load = |name: &core::ffi::CStr| unsafe {
            get_device_proc_addr(queue_info.device, name.as_ptr())
                .map_or(ptr::null(), |func| func as *const c_void)
        };
        let device = unsafe { ash::Device::load_with(load, queue_info.device) };
        let swapchain_fn = khr::swapchain::DeviceFn::load(load);

        let mut memory_properties = vk::PhysicalDeviceMemoryProperties::default();
        unsafe { get_memory_properties(device_info.physical_device, &mut memory_properties) };

        unsafe {
            let command_pool = device.create_command_pool(
                &vk::CommandPoolCreateInfo::default()
                    .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)
                    .queue_family_index(queue_info.family),
                None,
            )?;
            let upload_fence = device.create_fence(&vk::FenceCreateInfo::default(), None)?;
            debug!(
                "vulkan driver created on queue family {}",
                queue_info.family
            );

            Ok(Self {
                device,
                swapchain_fn,
                memory_properties,
                queue,
                command_pool,
                upload_fence,
                targets: None,
                textures: HashMap::default(),
            })
        }
    }

    fn memory_type(
        &self,
        requirements: &vk::MemoryRequirements,
        flags: vk::MemoryPropertyFlags,
    ) -> anyhow::Result<u32> {
        let props = &self.memory_properties;
        props.memory_types[..props.memory_type_count as usize]
            .iter()
            .enumerate()
            .find(|&(i, ty)| {
                requirements.memory_type_bits & (1 << i) != 0 && ty.property_flags.contains(flags)
            })
            .map(|(i, _)| i as u32)
            .with_context(|| format!("no memory type with flags {:#x}", flags.as_raw()))
    }

    fn swapchain_images(&self, swapchain: vk::SwapchainKHR) -> anyhow::Result<Vec<vk::Image>> {
        let get_images = self.swapchain_fn.get_swapchain_images_khr;
        let device = self.device.handle();

        unsafe {
            let mut count = 0;
            get_images(device, swapchain, &mut count, ptr::null_mut()).result()?;
            let mut images = vec![vk::Image::null(); count as usize];
            get_images(device, swapchain, &mut count, images.as_mut_ptr()).result()?;
            images.truncate(count as usize);
            Ok(images)
        }
    }

    fn create_targets(&self, swapchain: vk::SwapchainKHR) -> anyhow::Result<SwapchainTargets> {
        let info = capture::swapchain_info(swapchain).context("swap chain was not captured")?;
        let images = self.swapchain_images(swapchain)?;

        let device = &self.device;
        let command_buffers = unsafe {
            device.allocate_command_buffers(
                &vk::CommandBufferAllocateInfo::default()
                    .command_pool(self.command_pool)
                    .level(vk::CommandBufferLevel::PRIMARY)
                    .command_buffer_count(images.len() as _),
            )?
        };

        let mut targets = SwapchainTargets {
            swapchain,
            extent: info.extent,
            images: Vec::with_capacity(images.len()),
        };
        for (image, command_buffer) in images.into_iter().zip(command_buffers) {
            let res = unsafe {
                (|| -> anyhow::Result<ImageTarget> {
                    let view = device.create_image_view(
                        &vk::ImageViewCreateInfo::default()
                            .image(image)
                            .view_type(vk::ImageViewType::TYPE_2D)
                            .format(info.format)
                            .subresource_range(color_range()),
                        None,
                    )?;
                    let fence = device.create_fence(
                        &vk::FenceCreateInfo::default().flags(vk::FenceCreateFlags::SIGNALED),
                        None,
                    )?;
                    let semaphore =
                        device.create_semaphore(&vk::SemaphoreCreateInfo::default(), None)?;

                    Ok(ImageTarget {
                        view,
                        image,
                        command_buffer,
                        fence,
                        semaphore,
                    })
                })()
            };

            match res {
                Ok(target) => targets.images.push(target),
                Err(err) => {
                    self.destroy_targets(targets);
                    return Err(err);
                }
            }
        }

        debug!(
            "swap chain {:?} with {} images {}x{}",
            swapchain,
            targets.images.len(),
            info.extent.width,
            info.extent.height
        );
        Ok(targets)
    }

    fn destroy_targets(&self, targets: SwapchainTargets) {
        let device = &self.device;
        unsafe {
            for target in targets.images {
                _ = device.wait_for_fences(&[target.fence], true, u64::MAX);
                device.destroy_semaphore(target.semaphore, None);
                device.destroy_fence(target.fence, None);
                device.free_command_buffers(self.command_pool, &[target.command_buffer]);
                device.destroy_image_view(target.view, None);
            }
        }
    }

    /// Wait until no submitted overlay command is running.
    fn wait_frames(&self) {
        let Some(ref targets) = self.targets else {
            return;
        };

        let fences = targets
            .images
            .iter()
            .map(|target| target.fence)
            .collect::<Vec<_>>();
        unsafe {
            _ = self.device.wait_for_fences(&fences, true, u64::MAX);
        }
    }

    fn record(
        &self,
        target: &ImageTarget,
        extent: vk::Extent2D,
        draw: &mut dyn FnMut(&NativeTarget),
    ) -> anyhow::Result<()> {
        let device = &self.device;
        let cb = target.command_buffer;

        unsafe {
            device.reset_command_buffer(cb, vk::CommandBufferResetFlags::empty())?;
            device.begin_command_buffer(
                cb,
                &vk::CommandBufferBeginInfo::default()
                    .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT),
            )?;

            barrier(
                device,
                cb,
                target.image,
                (vk::ImageLayout::PRESENT_SRC_KHR, vk::AccessFlags::empty()),
                (
                    vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
                    vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
                ),
                vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
                vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
            );
        }

        draw(&NativeTarget {
            api: Api::Vulkan,
            device: device.handle().as_raw() as usize,
            context: cb.as_raw() as usize,
            render_target: target.view.as_raw(),
            width: extent.width,
            height: extent.height,
        });

        unsafe {
            barrier(
                device,
                cb,
                target.image,
                (
                    vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
                    vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
                ),
                (vk::ImageLayout::PRESENT_SRC_KHR, vk::AccessFlags::empty()),
                vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
                vk::PipelineStageFlags::BOTTOM_OF_PIPE,
            );
            device.end_command_buffer(cb)?;
        }

        Ok(())
    }

    fn create_buffer(
        &self,
        size: u64,
        usage: vk::BufferUsageFlags,
        flags: vk::MemoryPropertyFlags,
    ) -> anyhow::Result<(vk::Buffer, vk::DeviceMemory)> {
        let device = &self.device;
        unsafe {
            let buffer = device.create_buffer(
                &vk::BufferCreateInfo::default()
                    .size(size)
                    .usage(usage)
                    .sharing_mode(vk::SharingMode::EXCLUSIVE),
                None,
            )?;
            let requirements = device.get_buffer_memory_requirements(buffer);
            let memory = self
                .memory_type(&requirements, flags)
                .and_then(|ty| {
                    Ok(device.allocate_memory(
                        &vk::MemoryAllocateInfo::default()
                            .allocation_size(requirements.size)
                            .memory_type_index(ty),
                        None,
                    )?)
                })
                .and_then(|memory| {
                    if let Err(err) = device.bind_buffer_memory(buffer, memory, 0) {
                        device.free_memory(memory, None);
                        return Err(err.into());
                    }
                    Ok(memory)
                });

            match memory {
                Ok(memory) => Ok((buffer, memory)),
                Err(err) => {
                    device.destroy_buffer(buffer, None);
                    Err(err)
                }
            }
        }
    }

    /// Record `f` into a one time command buffer and wait for its completion.
    fn submit_now(&self, f: impl FnOnce(vk::CommandBuffer)) -> anyhow::Result<()> {
        let device = &self.device;
        unsafe {
            let cb = device.allocate_command_buffers(
                &vk::CommandBufferAllocateInfo::default()
                    .command_pool(self.command_pool)
                    .level(vk::CommandBufferLevel::PRIMARY)
                    .command_buffer_count(1),
            )?[0];
            scopeguard::defer!(device.free_command_buffers(self.command_pool, &[cb]));

            device.begin_command_buffer(
                cb,
                &vk::CommandBufferBeginInfo::default()
                    .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT),
            )?;
            f(cb);
            device.end_command_buffer(cb)?;

            device.reset_fences(&[self.upload_fence])?;
            device.queue_submit(
                self.queue,
                &[vk::SubmitInfo::default().command_buffers(slice::from_ref(&cb))],
                self.upload_fence,
            )?;
            device.wait_for_fences(&[self.upload_fence], true, u64::MAX)?;
        }

        Ok(())
    }
}

fn color_range() -> vk::ImageSubresourceRange {
    vk::ImageSubresourceRange::default()
        .aspect_mask(vk::ImageAspectFlags::COLOR)
        .level_count(1)
        .layer_count(1)
}

unsafe fn barrier(
    device: &ash::Device,
    cb: vk::CommandBuffer,
    image: vk::Image,
    (old_layout, src_access): (vk::ImageLayout, vk::AccessFlags),
    (new_layout, dst_access): (vk::ImageLayout, vk::AccessFlags),
    src_stage: vk::PipelineStageFlags,
    dst_stage: vk::PipelineStageFlags,
) {
    let barrier = vk::ImageMemoryBarrier::default()
        .image(image)
        .old_layout(old_layout)
        .new_layout(new_layout)
        .src_access_mask(src_access)
        .dst_access_mask(dst_access)
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .subresource_range(color_range());

    unsafe {
        device.cmd_pipeline_barrier(
            cb,
            src_stage,
            dst_stage,
            vk::DependencyFlags::empty(),
            &[],
            &[],
            &[barrier],
        );
    }
}

/// First swap chain of a present and its image index.
fn presented_image(info: &vk::PresentInfoKHR<'_>) -> Option<(vk::SwapchainKHR, usize)> {
    if info.swapchain_count == 0 || info.p_swapchains.is_null() || info.p_image_indices.is_null()
    {
        return None;
    }

    unsafe { Some((*info.p_swapchains, *info.p_image_indices as usize)) }
}

impl RenderDriver for VulkanDriver {
    fn init(&mut self, frame: &Frame<'_>) -> anyhow::Result<()> {
        let Frame::Vulkan { present_info, .. } = frame else {
            bail!("not a vulkan frame");
        };
        let (swapchain, _) = presented_image(present_info).context("nothing presented")?;

        if let Some(targets) = self.targets.take() {
            self.destroy_targets(targets);
        }
        self.targets = Some(self.create_targets(swapchain)?);
        Ok(())
    }

    fn release(&mut self, _: Release) {
        if let Some(targets) = self.targets.take() {
            self.destroy_targets(targets);
        }
    }

    fn render(
        &mut self,
        frame: &Frame<'_>,
        draw: &mut dyn FnMut(&NativeTarget),
    ) -> anyhow::Result<()> {
        let &Frame::Vulkan {
            queue,
            present_info,
            wait,
        } = frame
        else {
            return Ok(());
        };

        if queue != self.queue {
            trace!("skipping present on foreign queue {:?}", queue);
            return Ok(());
        }

        let Some((swapchain, index)) = presented_image(present_info) else {
            return Ok(());
        };

        if self
            .targets
            .as_ref()
            .is_none_or(|targets| targets.swapchain != swapchain)
        {
            self.init(frame)?;
        }

        let Some(ref targets) = self.targets else {
            return Ok(());
        };
        let Some(target) = targets.images.get(index) else {
            bail!("image index {index} out of range");
        };

        unsafe {
            self.device
                .wait_for_fences(&[target.fence], true, u64::MAX)?;
        }
        self.record(target, targets.extent, draw)?;

        let host_waits = if present_info.p_wait_semaphores.is_null() {
            &[][..]
        } else {
            unsafe {
                slice::from_raw_parts(
                    present_info.p_wait_semaphores,
                    present_info.wait_semaphore_count as usize,
                )
            }
        };
        let stages = vec![vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT; host_waits.len()];

        unsafe {
            self.device.reset_fences(&[target.fence])?;
            self.device.queue_submit(
                queue,
                &[vk::SubmitInfo::default()
                    .wait_semaphores(host_waits)
                    .wait_dst_stage_mask(&stages)
                    .command_buffers(slice::from_ref(&target.command_buffer))
                    .signal_semaphores(slice::from_ref(&target.semaphore))],
                target.fence,
            )?;
        }

        wait.set(target.semaphore);
        Ok(())
    }

    fn create_texture(
        &mut self,
        pixels: &[u8],
        width: u32,
        height: u32,
    ) -> anyhow::Result<NativeTexture> {
        let device = &self.device;
        let size = pixels.len() as u64;

        let (staging, staging_memory) = self.create_buffer(
            size,
            vk::BufferUsageFlags::TRANSFER_SRC,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
        )?;
        scopeguard::defer!(unsafe {
            device.destroy_buffer(staging, None);
            device.free_memory(staging_memory, None);
        });

        unsafe {
            let mapped = device.map_memory(staging_memory, 0, size, vk::MemoryMapFlags::empty())?;
            ptr::copy_nonoverlapping(pixels.as_ptr(), mapped.cast::<u8>(), pixels.len());
            device.unmap_memory(staging_memory);
        }

        let image = unsafe {
            device.create_image(
                &vk::ImageCreateInfo::default()
                    .image_type(vk::ImageType::TYPE_2D)
                    .format(vk::Format::R8G8B8A8_UNORM)
                    .extent(vk::Extent3D {
                        width,
                        height,
                        depth: 1,
                    })
                    .mip_levels(1)
                    .array_layers(1)
                    .samples(vk::SampleCountFlags::TYPE_1)
                    .tiling(vk::ImageTiling::OPTIMAL)
                    .usage(vk::ImageUsageFlags::SAMPLED | vk::ImageUsageFlags::TRANSFER_DST)
                    .sharing_mode(vk::SharingMode::EXCLUSIVE)
                    .initial_layout(vk::ImageLayout::UNDEFINED),
                None,
            )?
        };

        let res = (|| -> anyhow::Result<(vk::DeviceMemory, vk::ImageView)> {
            let requirements = unsafe { device.get_image_memory_requirements(image) };
            let memory = unsafe {
                device.allocate_memory(
                    &vk::MemoryAllocateInfo::default()
                        .allocation_size(requirements.size)
                        .memory_type_index(self.memory_type(
                            &requirements,
                            vk::MemoryPropertyFlags::DEVICE_LOCAL,
                        )?),
                    None,
                )?
            };

            let upload = (|| -> anyhow::Result<vk::ImageView> {
                unsafe { device.bind_image_memory(image, memory, 0)? };

                self.submit_now(|cb| unsafe {
                    barrier(
                        device,
                        cb,
                        image,
                        (vk::ImageLayout::UNDEFINED, vk::AccessFlags::empty()),
                        (
                            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                            vk::AccessFlags::TRANSFER_WRITE,
                        ),
                        vk::PipelineStageFlags::TOP_OF_PIPE,
                        vk::PipelineStageFlags::TRANSFER,
                    );
                    device.cmd_copy_buffer_to_image(
                        cb,
                        staging,
                        image,
                        vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                        &[vk::BufferImageCopy::default()
                            .image_subresource(
                                vk::ImageSubresourceLayers::default()
                                    .aspect_mask(vk::ImageAspectFlags::COLOR)
                                    .layer_count(1),
                            )
                            .image_extent(vk::Extent3D {
                                width,
                                height,
                                depth: 1,
                            })],
                    );
                    barrier(
                        device,
                        cb,
                        image,
                        (
                            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                            vk::AccessFlags::TRANSFER_WRITE,
                        ),
                        (
                            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                            vk::AccessFlags::SHADER_READ,
                        ),
                        vk::PipelineStageFlags::TRANSFER,
                        vk::PipelineStageFlags::FRAGMENT_SHADER,
                    );
                })?;

                Ok(unsafe {
                    device.create_image_view(
                        &vk::ImageViewCreateInfo::default()
                            .image(image)
                            .view_type(vk::ImageViewType::TYPE_2D)
                            .format(vk::Format::R8G8B8A8_UNORM)
                            .subresource_range(color_range()),
                        None,
                    )?
                })
            })();

            match upload {
                Ok(view) => Ok((memory, view)),
                Err(err) => {
                    unsafe { device.free_memory(memory, None) };
                    Err(err)
                }
            }
        })();

        let (memory, view) = match res {
            Ok(res) => res,
            Err(err) => {
                unsafe { device.destroy_image(image, None) };
                return Err(err);
            }
        };

        self.textures.insert(image.as_raw(), memory);
        Ok(NativeTexture {
            handle: image.as_raw(),
            view: view.as_raw(),
            width,
            height,
        })
    }

    fn destroy_texture(&mut self, texture: NativeTexture) {
        let Some(memory) = self.textures.remove(&texture.handle) else {
            return;
        };

        self.wait_frames();
        let device = &self.device;
        unsafe {
            device.destroy_image_view(vk::ImageView::from_raw(texture.view), None);
            device.destroy_image(vk::Image::from_raw(texture.handle), None);
            device.free_memory(memory, None);
        }
    }
}

impl Drop for VulkanDriver {
    fn drop(&mut self) {
        if let Some(targets) = self.targets.take() {
            self.destroy_targets(targets);
        }

        let device = &self.device;
        unsafe {
            device.destroy_fence(self.upload_fence, None);
            device.destroy_command_pool(self.command_pool, None);
        }
    }
}

unsafe impl Send for VulkanDriver {}
