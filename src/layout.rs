//! Image layout transitions and the layout state of bindless textures.

use ash::vk;

/// Where a bindless texture image is in its upload lifecycle.
///
/// Images start `Undefined`, are written while `TransferDst`, and are only ever sampled once
/// they reach `ShaderReadOnly`. No other transitions are legal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageLayoutState {
    Undefined,
    TransferDst,
    ShaderReadOnly,
}

/// Access masks and stages for one legal transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LayoutTransition {
    pub old_layout: vk::ImageLayout,
    pub new_layout: vk::ImageLayout,
    pub src_access: vk::AccessFlags,
    pub dst_access: vk::AccessFlags,
    pub src_stage: vk::PipelineStageFlags,
    pub dst_stage: vk::PipelineStageFlags,
}

impl ImageLayoutState {
    pub fn vk_layout(self) -> vk::ImageLayout {
        match self {
            ImageLayoutState::Undefined => vk::ImageLayout::UNDEFINED,
            ImageLayoutState::TransferDst => vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            ImageLayoutState::ShaderReadOnly => vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        }
    }

    /// The barrier parameters for moving from `self` to `next`, or `None` if the move is illegal.
    pub fn transition_to(self, next: ImageLayoutState) -> Option<LayoutTransition> {
        let (src_access, dst_access, src_stage, dst_stage) = match (self, next) {
            (ImageLayoutState::Undefined, ImageLayoutState::TransferDst) => (
                vk::AccessFlags::empty(),
                vk::AccessFlags::TRANSFER_WRITE,
                vk::PipelineStageFlags::TOP_OF_PIPE,
                vk::PipelineStageFlags::TRANSFER,
            ),
            (ImageLayoutState::TransferDst, ImageLayoutState::ShaderReadOnly) => (
                vk::AccessFlags::TRANSFER_WRITE,
                vk::AccessFlags::SHADER_READ,
                vk::PipelineStageFlags::TRANSFER,
                vk::PipelineStageFlags::FRAGMENT_SHADER | vk::PipelineStageFlags::COMPUTE_SHADER,
            ),
            _ => return None,
        };
        Some(LayoutTransition {
            old_layout: self.vk_layout(),
            new_layout: next.vk_layout(),
            src_access,
            dst_access,
            src_stage,
            dst_stage,
        })
    }
}

/// Tracks one image's layout and records barriers as it advances.
#[derive(Debug)]
pub struct TrackedLayout {
    state: ImageLayoutState,
}

impl Default for TrackedLayout {
    fn default() -> Self {
        Self {
            state: ImageLayoutState::Undefined,
        }
    }
}

impl TrackedLayout {
    pub fn state(&self) -> ImageLayoutState {
        self.state
    }

    /// Advance to `next`, returning the barrier to record. Panics on an illegal transition.
    pub fn advance(&mut self, next: ImageLayoutState) -> LayoutTransition {
        let transition = self.state.transition_to(next).unwrap_or_else(|| {
            panic!(
                "illegal image layout transition {:?} -> {:?}",
                self.state, next
            )
        });
        self.state = next;
        transition
    }

    /// Advance to `next` and record the matching barrier into `cmd`.
    pub fn record(
        &mut self,
        device: &ash::Device,
        cmd: vk::CommandBuffer,
        image: vk::Image,
        next: ImageLayoutState,
    ) {
        let t = self.advance(next);
        cmd_transition_image(
            device,
            cmd,
            image,
            t.old_layout,
            t.new_layout,
            t.src_access,
            t.dst_access,
            t.src_stage,
            t.dst_stage,
        );
    }
}

/// Record a single-mip, single-layer color image layout transition.
#[allow(clippy::too_many_arguments)]
pub fn cmd_transition_image(
    device: &ash::Device,
    cmd: vk::CommandBuffer,
    image: vk::Image,
    old_layout: vk::ImageLayout,
    new_layout: vk::ImageLayout,
    src_access: vk::AccessFlags,
    dst_access: vk::AccessFlags,
    src_stage: vk::PipelineStageFlags,
    dst_stage: vk::PipelineStageFlags,
) {
    let barrier = vk::ImageMemoryBarrier::default()
        .old_layout(old_layout)
        .new_layout(new_layout)
        .src_access_mask(src_access)
        .dst_access_mask(dst_access)
        .image(image)
        .subresource_range(
            vk::ImageSubresourceRange::default()
                .aspect_mask(vk::ImageAspectFlags::COLOR)
                .base_mip_level(0)
                .level_count(1)
                .base_array_layer(0)
                .layer_count(1),
        )
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED);

    unsafe {
        device.cmd_pipeline_barrier(
            cmd,
            src_stage,
            dst_stage,
            vk::DependencyFlags::empty(),
            &[],
            &[],
            &[barrier],
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upload_path_reaches_shader_read() {
        let mut layout = TrackedLayout::default();
        let first = layout.advance(ImageLayoutState::TransferDst);
        assert_eq!(first.old_layout, vk::ImageLayout::UNDEFINED);
        assert_eq!(first.dst_access, vk::AccessFlags::TRANSFER_WRITE);

        let second = layout.advance(ImageLayoutState::ShaderReadOnly);
        assert_eq!(second.old_layout, vk::ImageLayout::TRANSFER_DST_OPTIMAL);
        assert_eq!(second.new_layout, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);
        assert_eq!(layout.state(), ImageLayoutState::ShaderReadOnly);
    }

    #[test]
    fn skipping_the_copy_is_illegal() {
        assert!(ImageLayoutState::Undefined
            .transition_to(ImageLayoutState::ShaderReadOnly)
            .is_none());
        assert!(ImageLayoutState::ShaderReadOnly
            .transition_to(ImageLayoutState::TransferDst)
            .is_none());
    }

    #[test]
    #[should_panic(expected = "illegal image layout transition")]
    fn tracked_layout_panics_on_illegal_move() {
        let mut layout = TrackedLayout::default();
        layout.advance(ImageLayoutState::ShaderReadOnly);
    }
}
