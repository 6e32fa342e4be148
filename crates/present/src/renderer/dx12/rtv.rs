use windows::Win32::Graphics::{Direct3D12::*, Dxgi::IDXGISwapChain};

/// Render target view of every back buffer, in one descriptor heap.
pub struct RtvDescriptors {
    heap: ID3D12DescriptorHeap,
    descriptor_size: usize,
    count: usize,
}

impl RtvDescriptors {
    pub fn new(device: &ID3D12Device, swapchain: &IDXGISwapChain) -> anyhow::Result<Self> {
        unsafe {
            let count = swapchain.GetDesc()?.BufferCount as usize;
            let heap = device.CreateDescriptorHeap::<ID3D12DescriptorHeap>(
                &D3D12_DESCRIPTOR_HEAP_DESC {
                    Type: D3D12_DESCRIPTOR_HEAP_TYPE_RTV,
                    Flags: D3D12_DESCRIPTOR_HEAP_FLAG_NONE,
                    NumDescriptors: count as _,
                    ..Default::default()
                },
            )?;
            let descriptor_size =
                device.GetDescriptorHandleIncrementSize(D3D12_DESCRIPTOR_HEAP_TYPE_RTV) as usize;

            let this = Self {
                heap,
                descriptor_size,
                count,
            };
            for i in 0..count {
                let back_buffer = swapchain.GetBuffer::<ID3D12Resource>(i as _)?;
                device.CreateRenderTargetView(&back_buffer, None, this.desc_for(i));
            }

            Ok(this)
        }
    }

    #[inline]
    pub fn count(&self) -> usize {
        self.count
    }

    pub fn desc_for(&self, back_buffer_index: usize) -> D3D12_CPU_DESCRIPTOR_HANDLE {
        unsafe {
            D3D12_CPU_DESCRIPTOR_HANDLE {
                ptr: self.heap.GetCPUDescriptorHandleForHeapStart().ptr
                    + self.descriptor_size * back_buffer_index,
            }
        }
    }
}
