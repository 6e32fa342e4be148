mod fence;
mod rtv;

use core::{
    ffi::c_void,
    mem::{self, ManuallyDrop},
    ptr,
};

use anyhow::Context;
use fence::FrameFence;
use rtv::RtvDescriptors;
use tracing::{debug, error};
use windows::{
    Win32::{
        Foundation::RECT,
        Graphics::{
            Direct3D12::*,
            Dxgi::{
                Common::{DXGI_FORMAT_R8G8B8A8_UNORM, DXGI_SAMPLE_DESC},
                IDXGISwapChain, IDXGISwapChain3,
            },
        },
    },
    core::Interface,
};

use super::{Release, RenderDriver};
use crate::{
    backend::call_original_execute_command_lists,
    frame::{Frame, NativeTarget},
    image::NativeTexture,
    types::Api,
};

// Cloning COM objects for ManuallyDrop<Option<T>> never decrease ref count and leak
unsafe fn wrap_com_manually_drop<T: Interface>(inf: &T) -> ManuallyDrop<Option<T>> {
    unsafe { mem::transmute_copy(inf) }
}

fn transition(
    resource: &ID3D12Resource,
    before: D3D12_RESOURCE_STATES,
    after: D3D12_RESOURCE_STATES,
) -> D3D12_RESOURCE_BARRIER {
    D3D12_RESOURCE_BARRIER {
        Type: D3D12_RESOURCE_BARRIER_TYPE_TRANSITION,
        Flags: D3D12_RESOURCE_BARRIER_FLAG_NONE,
        Anonymous: D3D12_RESOURCE_BARRIER_0 {
            Transition: ManuallyDrop::new(D3D12_RESOURCE_TRANSITION_BARRIER {
                pResource: unsafe { wrap_com_manually_drop(resource) },
                Subresource: D3D12_RESOURCE_BARRIER_ALL_SUBRESOURCES,
                StateBefore: before,
                StateAfter: after,
            }),
        },
    }
}

struct CommandRecorder {
    list: ID3D12GraphicsCommandList,
    allocator: ID3D12CommandAllocator,
    /// Fence value of the last submission recorded with this allocator.
    submitted: u64,
}

impl CommandRecorder {
    fn new(device: &ID3D12Device) -> anyhow::Result<Self> {
        unsafe {
            let allocator = device
                .CreateCommandAllocator::<ID3D12CommandAllocator>(D3D12_COMMAND_LIST_TYPE_DIRECT)?;
            let list = device.CreateCommandList::<_, _, ID3D12GraphicsCommandList>(
                0,
                D3D12_COMMAND_LIST_TYPE_DIRECT,
                &allocator,
                None,
            )?;
            list.Close()?;

            Ok(Self {
                list,
                allocator,
                submitted: 0,
            })
        }
    }

    /// Open the list after the gpu finished its last submission.
    fn begin(&mut self, fence: &FrameFence) -> anyhow::Result<&ID3D12GraphicsCommandList> {
        fence.wait(self.submitted)?;
        unsafe {
            self.allocator.Reset()?;
            self.list.Reset(&self.allocator, None)?;
        }

        Ok(&self.list)
    }

    fn submit(
        &mut self,
        queue: &ID3D12CommandQueue,
        fence: &mut FrameFence,
    ) -> anyhow::Result<()> {
        unsafe {
            self.list.Close()?;
            call_original_execute_command_lists(queue.as_raw(), 1, &self.list.as_raw());
        }
        self.submitted = fence.signal(queue)?;

        Ok(())
    }
}

struct RenderTargets {
    rtv: RtvDescriptors,
    recorders: Vec<CommandRecorder>,
    size: (u32, u32),
}

pub struct Dx12Driver {
    swapchain: IDXGISwapChain3,
    device: ID3D12Device,
    /// Queue of the last frame, used for uploads.
    queue: Option<ID3D12CommandQueue>,
    fence: FrameFence,
    upload: Option<CommandRecorder>,
    targets: Option<RenderTargets>,
}

impl Dx12Driver {
    #[tracing::instrument]
    pub fn new(swapchain: *mut c_void) -> anyhow::Result<Self> {
        let swapchain = unsafe { IDXGISwapChain::from_raw_borrowed(&swapchain) }
            .context("null IDXGISwapChain")?
            .cast::<IDXGISwapChain3>()?;

        let device = unsafe { swapchain.GetDevice::<ID3D12Device>()? };
        let fence = FrameFence::new(&device)?;

        Ok(Self {
            swapchain,
            device,
            queue: None,
            fence,
            upload: None,
            targets: None,
        })
    }

    fn set_queue(&mut self, frame: &Frame<'_>) -> Option<ID3D12CommandQueue> {
        let &Frame::Dxgi {
            queue: Some(queue), ..
        } = frame
        else {
            return None;
        };

        let queue = unsafe { ID3D12CommandQueue::from_raw_borrowed(&queue) }.cloned()?;
        self.queue = Some(queue.clone());
        Some(queue)
    }

    fn wait_idle(&self) {
        if let Err(err) = self.fence.wait_idle() {
            error!("waiting for gpu failed. err: {err:?}");
        }
    }
}

impl RenderDriver for Dx12Driver {
    fn init(&mut self, frame: &Frame<'_>) -> anyhow::Result<()> {
        self.set_queue(frame).context("command queue not captured")?;

        let swapchain = self.swapchain.cast::<IDXGISwapChain>()?;
        let desc = unsafe { swapchain.GetDesc()? };
        let rtv = RtvDescriptors::new(&self.device, &swapchain)?;
        let recorders = (0..rtv.count())
            .map(|_| CommandRecorder::new(&self.device))
            .collect::<anyhow::Result<Vec<_>>>()?;
        debug!(
            "{} back buffers {}x{}",
            rtv.count(),
            desc.BufferDesc.Width,
            desc.BufferDesc.Height
        );

        self.targets = Some(RenderTargets {
            rtv,
            recorders,
            size: (desc.BufferDesc.Width, desc.BufferDesc.Height),
        });
        Ok(())
    }

    fn release(&mut self, scope: Release) {
        // back buffers may still be used by submitted frames
        self.wait_idle();
        self.targets.take();

        if scope == Release::All {
            self.upload.take();
            self.queue.take();
        }
    }

    fn render(
        &mut self,
        frame: &Frame<'_>,
        draw: &mut dyn FnMut(&NativeTarget),
    ) -> anyhow::Result<()> {
        let Some(queue) = self.set_queue(frame) else {
            return Ok(());
        };

        let Some(ref mut targets) = self.targets else {
            return Ok(());
        };

        if targets.size.0 == 0 || targets.size.1 == 0 {
            return Ok(());
        }

        unsafe {
            let index = self.swapchain.GetCurrentBackBufferIndex() as usize;
            let back_buffer = self.swapchain.GetBuffer::<ID3D12Resource>(index as _)?;
            let render_target = targets.rtv.desc_for(index);
            let recorder = targets
                .recorders
                .get_mut(index)
                .context("back buffer index out of range")?;

            let list = recorder.begin(&self.fence)?;
            list.ResourceBarrier(&[transition(
                &back_buffer,
                D3D12_RESOURCE_STATE_PRESENT,
                D3D12_RESOURCE_STATE_RENDER_TARGET,
            )]);
            list.OMSetRenderTargets(1, Some(&render_target), true, None);
            list.RSSetViewports(&[D3D12_VIEWPORT {
                TopLeftX: 0.0,
                TopLeftY: 0.0,
                Width: targets.size.0 as _,
                Height: targets.size.1 as _,
                MinDepth: D3D12_MIN_DEPTH,
                MaxDepth: D3D12_MAX_DEPTH,
            }]);
            list.RSSetScissorRects(&[RECT {
                left: 0,
                top: 0,
                right: targets.size.0 as _,
                bottom: targets.size.1 as _,
            }]);

            draw(&NativeTarget {
                api: Api::Dx12,
                device: self.device.as_raw() as usize,
                context: list.as_raw() as usize,
                render_target: render_target.ptr as u64,
                width: targets.size.0,
                height: targets.size.1,
            });

            list.ResourceBarrier(&[transition(
                &back_buffer,
                D3D12_RESOURCE_STATE_RENDER_TARGET,
                D3D12_RESOURCE_STATE_PRESENT,
            )]);
            recorder.submit(&queue, &mut self.fence)?;
        }

        Ok(())
    }

    fn create_texture(
        &mut self,
        pixels: &[u8],
        width: u32,
        height: u32,
    ) -> anyhow::Result<NativeTexture> {
        let queue = self.queue.clone().context("command queue not captured")?;
        let device = &self.device;

        unsafe {
            let mut texture = None;
            device.CreateCommittedResource::<ID3D12Resource>(
                &D3D12_HEAP_PROPERTIES {
                    Type: D3D12_HEAP_TYPE_DEFAULT,
                    ..Default::default()
                },
                D3D12_HEAP_FLAG_NONE,
                &D3D12_RESOURCE_DESC {
                    Dimension: D3D12_RESOURCE_DIMENSION_TEXTURE2D,
                    Width: width as _,
                    Height: height,
                    DepthOrArraySize: 1,
                    MipLevels: 1,
                    Format: DXGI_FORMAT_R8G8B8A8_UNORM,
                    SampleDesc: DXGI_SAMPLE_DESC {
                        Count: 1,
                        Quality: 0,
                    },
                    ..Default::default()
                },
                D3D12_RESOURCE_STATE_COPY_DEST,
                None,
                &mut texture,
            )?;
            let texture = texture.context("cannot create texture")?;

            let mut footprint = D3D12_PLACED_SUBRESOURCE_FOOTPRINT::default();
            let mut total_bytes = 0;
            let mut num_rows = 0;
            let mut row_size = 0;
            device.GetCopyableFootprints(
                &texture.GetDesc(),
                0,
                1,
                0,
                Some(&mut footprint),
                Some(&mut num_rows),
                Some(&mut row_size),
                Some(&mut total_bytes),
            );

            let mut upload = None;
            device.CreateCommittedResource::<ID3D12Resource>(
                &D3D12_HEAP_PROPERTIES {
                    Type: D3D12_HEAP_TYPE_UPLOAD,
                    ..Default::default()
                },
                D3D12_HEAP_FLAG_NONE,
                &D3D12_RESOURCE_DESC {
                    Dimension: D3D12_RESOURCE_DIMENSION_BUFFER,
                    Width: total_bytes,
                    Height: 1,
                    DepthOrArraySize: 1,
                    MipLevels: 1,
                    Layout: D3D12_TEXTURE_LAYOUT_ROW_MAJOR,
                    SampleDesc: DXGI_SAMPLE_DESC {
                        Count: 1,
                        Quality: 0,
                    },
                    ..Default::default()
                },
                D3D12_RESOURCE_STATE_GENERIC_READ,
                None,
                &mut upload,
            )?;
            let upload = upload.context("cannot create upload buffer")?;

            let mut mapped = ptr::null_mut::<c_void>();
            upload
                .Map(0, None, Some(&raw mut mapped))
                .context("cannot map upload buffer")?;
            let line_size = width as usize * 4;
            for (row, line) in pixels.chunks_exact(line_size).enumerate() {
                ptr::copy_nonoverlapping(
                    line.as_ptr(),
                    mapped
                        .cast::<u8>()
                        .add(footprint.Offset as usize)
                        .add(row * footprint.Footprint.RowPitch as usize),
                    line_size,
                );
            }
            upload.Unmap(0, None);

            let recorder = match self.upload {
                Some(ref mut recorder) => recorder,
                None => self.upload.insert(CommandRecorder::new(device)?),
            };
            let list = recorder.begin(&self.fence)?;
            list.CopyTextureRegion(
                &D3D12_TEXTURE_COPY_LOCATION {
                    pResource: wrap_com_manually_drop(&texture),
                    Type: D3D12_TEXTURE_COPY_TYPE_SUBRESOURCE_INDEX,
                    Anonymous: D3D12_TEXTURE_COPY_LOCATION_0 {
                        SubresourceIndex: 0,
                    },
                },
                0,
                0,
                0,
                &D3D12_TEXTURE_COPY_LOCATION {
                    pResource: wrap_com_manually_drop(&upload),
                    Type: D3D12_TEXTURE_COPY_TYPE_PLACED_FOOTPRINT,
                    Anonymous: D3D12_TEXTURE_COPY_LOCATION_0 {
                        PlacedFootprint: footprint,
                    },
                },
                None,
            );
            list.ResourceBarrier(&[transition(
                &texture,
                D3D12_RESOURCE_STATE_COPY_DEST,
                D3D12_RESOURCE_STATE_PIXEL_SHADER_RESOURCE,
            )]);
            recorder.submit(&queue, &mut self.fence)?;

            // upload buffer must outlive the copy
            self.fence.wait(recorder.submitted)?;

            Ok(NativeTexture {
                handle: texture.into_raw() as u64,
                view: 0,
                width,
                height,
            })
        }
    }

    fn destroy_texture(&mut self, texture: NativeTexture) {
        // texture may be referenced by frames in flight
        self.wait_idle();
        drop(unsafe { ID3D12Resource::from_raw(texture.handle as *mut c_void) });
    }
}

impl Drop for Dx12Driver {
    fn drop(&mut self) {
        self.wait_idle();
    }
}

unsafe impl Send for Dx12Driver {}
