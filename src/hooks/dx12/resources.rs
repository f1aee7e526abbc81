//! Overlay-owned GPU objects and their acquisition.

use std::sync::{Arc, Weak};

use anyhow::{bail, ensure, Context, Result};
use tracing::{debug, trace, warn};

use super::Dx12Api;
use crate::hooks::WindowHandle;
use crate::ImageResource;

/// Slots of the shader-visible heap reserved for the UI font atlas.
pub const RESERVED_DESCRIPTORS: u32 = 1;

/// Type of a descriptor heap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeapKind {
    /// Shader-visible `CBV_SRV_UAV` heap holding overlay textures.
    ShaderResource,
    /// Non shader-visible heap of render-target views.
    RenderTarget,
}

/// CPU descriptor handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CpuDescriptor(pub usize);

/// GPU descriptor handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GpuDescriptor(pub u64);

/// Free list over a fixed descriptor table.
#[derive(Debug, Clone)]
pub struct DescriptorSlots {
    capacity: u32,
    reserved: u32,
    free: Vec<u32>,
}

impl DescriptorSlots {
    /// A table of `capacity` slots whose first `reserved` slots are never
    /// handed out.
    pub fn new(capacity: u32, reserved: u32) -> Self {
        let reserved = reserved.min(capacity);
        Self { capacity, reserved, free: (reserved..capacity).rev().collect() }
    }

    /// Take the lowest free slot.
    pub fn allocate(&mut self) -> Option<u32> {
        self.free.pop()
    }

    /// Give a slot back. Returns `false` for reserved, out of range or
    /// already free slots.
    pub fn release(&mut self, slot: u32) -> bool {
        if slot < self.reserved || slot >= self.capacity || self.free.contains(&slot) {
            return false;
        }
        self.free.push(slot);
        true
    }

    /// Number of slots that can still be allocated.
    pub fn available(&self) -> usize {
        self.free.len()
    }

    /// Total number of slots, reserved ones included.
    pub fn capacity(&self) -> u32 {
        self.capacity
    }
}

/// Back buffer of the host swap chain and its render-target view.
pub struct RenderTarget<A: Dx12Api> {
    pub(crate) resource: A::Resource,
    pub(crate) descriptor: CpuDescriptor,
}

struct ImageEntry<A: Dx12Api> {
    image: Arc<ImageResource>,
    _texture: A::Texture,
}

/// Every GPU object the overlay owns while the resources are initialized.
///
/// The per-buffer vectors are exactly `buffer_count` long and index-aligned
/// with the host back-buffer index. Fields drop in declaration order, which
/// is the reverse of acquisition order.
pub struct FrameResources<A: Dx12Api> {
    images: Vec<ImageEntry<A>>,
    pub(crate) targets: Vec<RenderTarget<A>>,
    pub(crate) command_list: A::CommandList,
    pub(crate) allocators: Vec<A::CommandAllocator>,
    pub(crate) rtv_heap: A::DescriptorHeap,
    pub(crate) srv_heap: A::DescriptorHeap,
    pub(crate) device: A::Device,
    slots: DescriptorSlots,
    buffer_count: u32,
    window: WindowHandle,
}

impl<A: Dx12Api> FrameResources<A> {
    /// Block until the GPU is done with every frame submitted so far.
    pub fn wait_idle(&self, api: &A) {
        for allocator in &self.allocators {
            if let Err(e) = api.wait_for_allocator(allocator) {
                warn!("Couldn't wait for the command allocator: {e:?}");
            }
        }
    }

    /// Build the resource set for `swap_chain`.
    ///
    /// Any failure drops what was created so far, in reverse order.
    pub fn acquire(api: &A, swap_chain: &A::SwapChain, descriptor_count: u32) -> Result<Self> {
        let device = api.device(swap_chain).context("obtaining the device of the swap chain")?;

        let desc = api.swap_chain_desc(swap_chain).context("reading the swap chain description")?;
        let buffer_count = desc.buffer_count;
        if buffer_count == 0 {
            bail!("swap chain reports no buffers");
        }
        trace!("Swap chain has {buffer_count} buffers");

        let descriptor_count = descriptor_count.max(RESERVED_DESCRIPTORS);
        let srv_heap = api
            .create_descriptor_heap(&device, HeapKind::ShaderResource, descriptor_count)
            .context("creating the shader resource heap")?;

        let rtv_heap = api
            .create_descriptor_heap(&device, HeapKind::RenderTarget, buffer_count)
            .context("creating the render target heap")?;

        let allocators = (0..buffer_count)
            .map(|i| {
                api.create_command_allocator(&device)
                    .with_context(|| format!("creating command allocator #{i}"))
            })
            .collect::<Result<Vec<_>>>()?;

        let command_list = api
            .create_command_list(&device, &allocators[0])
            .context("creating the command list")?;
        api.close(&command_list).context("closing the new command list")?;

        let targets = (0..buffer_count)
            .map(|i| {
                let resource =
                    api.back_buffer(swap_chain, i).with_context(|| format!("fetching buffer #{i}"))?;
                let descriptor = api.create_render_target_view(&device, &rtv_heap, i, &resource);
                Ok(RenderTarget { resource, descriptor })
            })
            .collect::<Result<Vec<_>>>()?;

        debug!("Acquired frame resources for {buffer_count} buffers");

        Ok(Self {
            images: Vec::new(),
            targets,
            command_list,
            allocators,
            rtv_heap,
            srv_heap,
            device,
            slots: DescriptorSlots::new(descriptor_count, RESERVED_DESCRIPTORS),
            buffer_count,
            window: desc.window,
        })
    }

    /// Buffer count of the swap chain the resources were built for.
    pub fn buffer_count(&self) -> u32 {
        self.buffer_count
    }

    /// Output window of that swap chain.
    pub fn window(&self) -> WindowHandle {
        self.window
    }

    /// Number of live image resources.
    pub fn image_count(&self) -> usize {
        self.images.len()
    }

    /// Upload an RGBA8 image into a free slot of the shader-visible heap.
    pub fn create_image(
        &mut self,
        api: &A,
        queue: &A::CommandQueue,
        data: &[u8],
        width: u32,
        height: u32,
    ) -> Result<Arc<ImageResource>> {
        ensure!(width > 0 && height > 0, "empty image {width}x{height}");
        let expected = width as usize * height as usize * 4;
        ensure!(
            data.len() == expected,
            "image {width}x{height} needs {expected} bytes, got {}",
            data.len()
        );

        let slot = self.slots.allocate().context("no free descriptor for the image")?;
        let created = api.create_texture(&self.device, queue, &self.srv_heap, slot, data, width, height);
        let (texture, descriptor) = match created {
            Ok(created) => created,
            Err(e) => {
                self.slots.release(slot);
                return Err(e.context(format!("uploading image into slot {slot}")));
            },
        };

        let image = Arc::new(ImageResource::new(descriptor.0, width, height, slot));
        self.images.push(ImageEntry { image: Arc::clone(&image), _texture: texture });
        debug!("Created image {width}x{height} in slot {slot}");
        Ok(image)
    }

    /// Release an image and its slot. Returns `false` if it is not owned by
    /// this resource set.
    pub fn release_image(&mut self, image: &Weak<ImageResource>) -> bool {
        let Some(image) = image.upgrade() else {
            return false;
        };
        let Some(index) = self.images.iter().position(|e| Arc::ptr_eq(&e.image, &image)) else {
            return false;
        };

        let entry = self.images.swap_remove(index);
        self.slots.release(entry.image.slot());
        debug!("Released image in slot {}", entry.image.slot());
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slots_skip_reserved_and_reuse_freed() {
        let mut slots = DescriptorSlots::new(4, 1);
        assert_eq!(slots.available(), 3);
        assert_eq!(slots.allocate(), Some(1));
        assert_eq!(slots.allocate(), Some(2));
        assert!(slots.release(1));
        assert!(!slots.release(1));
        assert!(!slots.release(0));
        assert!(!slots.release(7));
        assert_eq!(slots.allocate(), Some(1));
        assert_eq!(slots.allocate(), Some(3));
        assert_eq!(slots.allocate(), None);
    }
}
