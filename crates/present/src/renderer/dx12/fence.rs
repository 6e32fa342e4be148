use windows::Win32::{
    Foundation::{CloseHandle, HANDLE},
    Graphics::Direct3D12::*,
    System::Threading::{CreateEventA, INFINITE, WaitForSingleObject},
};

/// Tracks gpu completion of submitted work.
pub struct FrameFence {
    fence: ID3D12Fence,
    event: HANDLE,
    value: u64,
}

impl FrameFence {
    pub fn new(device: &ID3D12Device) -> anyhow::Result<Self> {
        Ok(Self {
            fence: unsafe { device.CreateFence(0, D3D12_FENCE_FLAG_NONE)? },
            event: unsafe { CreateEventA(None, false, false, None)? },
            value: 0,
        })
    }

    /// Signal after the work submitted to `queue` so far. Returns the value to wait for.
    pub fn signal(&mut self, queue: &ID3D12CommandQueue) -> anyhow::Result<u64> {
        self.value += 1;
        unsafe {
            queue.Signal(&self.fence, self.value)?;
        }

        Ok(self.value)
    }

    pub fn wait(&self, value: u64) -> anyhow::Result<()> {
        unsafe {
            if self.fence.GetCompletedValue() < value {
                self.fence.SetEventOnCompletion(value, self.event)?;
                WaitForSingleObject(self.event, INFINITE);
            }
        }

        Ok(())
    }

    /// Wait for every signaled submission.
    pub fn wait_idle(&self) -> anyhow::Result<()> {
        self.wait(self.value)
    }
}

impl Drop for FrameFence {
    fn drop(&mut self) {
        unsafe {
            _ = CloseHandle(self.event);
        }
    }
}
