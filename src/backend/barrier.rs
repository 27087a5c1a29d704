// Image layout transitions
//
// Only the pairs listed in `transition_masks` are supported. Anything else is
// a logic error in the caller and is reported instead of guessed at.

use anyhow::Result;
use ash::vk;

/// Access and stage masks for one image memory barrier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransitionMasks {
    pub src_access: vk::AccessFlags,
    pub dst_access: vk::AccessFlags,
    pub src_stage: vk::PipelineStageFlags,
    pub dst_stage: vk::PipelineStageFlags,
}

/// Stages that touch the storage image while it sits in GENERAL
fn shader_stages() -> vk::PipelineStageFlags {
    vk::PipelineStageFlags::COMPUTE_SHADER
        | vk::PipelineStageFlags::FRAGMENT_SHADER
        | vk::PipelineStageFlags::RAY_TRACING_SHADER_KHR
}

pub fn transition_masks(old: vk::ImageLayout, new: vk::ImageLayout) -> Result<TransitionMasks> {
    use vk::AccessFlags as A;
    use vk::ImageLayout as L;
    use vk::PipelineStageFlags as S;

    let masks = |src_access, dst_access, src_stage, dst_stage| TransitionMasks {
        src_access,
        dst_access,
        src_stage,
        dst_stage,
    };

    let shader_rw = A::SHADER_READ | A::SHADER_WRITE;

    Ok(match (old, new) {
        (L::UNDEFINED, L::TRANSFER_DST_OPTIMAL) => {
            masks(A::empty(), A::TRANSFER_WRITE, S::TOP_OF_PIPE, S::TRANSFER)
        }
        (L::TRANSFER_DST_OPTIMAL, L::SHADER_READ_ONLY_OPTIMAL) => {
            masks(A::TRANSFER_WRITE, A::SHADER_READ, S::TRANSFER, S::FRAGMENT_SHADER)
        }
        (L::UNDEFINED, L::GENERAL) => {
            masks(A::empty(), shader_rw, S::TOP_OF_PIPE, shader_stages())
        }
        (L::TRANSFER_SRC_OPTIMAL, L::TRANSFER_DST_OPTIMAL) => {
            masks(A::TRANSFER_READ, A::TRANSFER_WRITE, S::TRANSFER, S::TRANSFER)
        }
        (L::TRANSFER_DST_OPTIMAL, L::PRESENT_SRC_KHR) => {
            masks(A::TRANSFER_WRITE, A::empty(), S::TRANSFER, S::BOTTOM_OF_PIPE)
        }
        (L::TRANSFER_SRC_OPTIMAL, L::GENERAL) => {
            masks(A::TRANSFER_READ, shader_rw, S::TRANSFER, shader_stages())
        }
        (L::GENERAL, L::TRANSFER_SRC_OPTIMAL) => {
            masks(shader_rw, A::TRANSFER_READ, shader_stages(), S::TRANSFER)
        }
        (L::PRESENT_SRC_KHR, L::TRANSFER_DST_OPTIMAL) => {
            masks(A::MEMORY_READ, A::TRANSFER_WRITE, S::BOTTOM_OF_PIPE, S::TRANSFER)
        }
        (L::TRANSFER_DST_OPTIMAL, L::COLOR_ATTACHMENT_OPTIMAL) => masks(
            A::TRANSFER_WRITE,
            A::COLOR_ATTACHMENT_READ | A::COLOR_ATTACHMENT_WRITE,
            S::TRANSFER,
            S::COLOR_ATTACHMENT_OUTPUT,
        ),
        (L::COLOR_ATTACHMENT_OPTIMAL, L::PRESENT_SRC_KHR) => masks(
            A::COLOR_ATTACHMENT_WRITE,
            A::empty(),
            S::COLOR_ATTACHMENT_OUTPUT,
            S::BOTTOM_OF_PIPE,
        ),
        (L::UNDEFINED, L::PRESENT_SRC_KHR) => {
            masks(A::empty(), A::empty(), S::TOP_OF_PIPE, S::BOTTOM_OF_PIPE)
        }
        _ => anyhow::bail!("Unsupported layout transition: {:?} -> {:?}", old, new),
    })
}

/// Single mip, single layer color image
pub fn color_subresource_range() -> vk::ImageSubresourceRange {
    vk::ImageSubresourceRange {
        aspect_mask: vk::ImageAspectFlags::COLOR,
        base_mip_level: 0,
        level_count: 1,
        base_array_layer: 0,
        layer_count: 1,
    }
}

/// Record a pipeline barrier moving `image` from `old` to `new`
pub fn record_transition(
    device: &ash::Device,
    cmd: vk::CommandBuffer,
    image: vk::Image,
    old: vk::ImageLayout,
    new: vk::ImageLayout,
) -> Result<()> {
    let masks = transition_masks(old, new)?;

    let barrier = vk::ImageMemoryBarrier::builder()
        .src_access_mask(masks.src_access)
        .dst_access_mask(masks.dst_access)
        .old_layout(old)
        .new_layout(new)
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .image(image)
        .subresource_range(color_subresource_range())
        .build();

    unsafe {
        device.cmd_pipeline_barrier(
            cmd,
            masks.src_stage,
            masks.dst_stage,
            vk::DependencyFlags::empty(),
            &[],
            &[],
            &[barrier],
        );
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use vk::AccessFlags as A;
    use vk::ImageLayout as L;
    use vk::PipelineStageFlags as S;

    #[test]
    fn swapchain_blit_target() {
        let m = transition_masks(L::UNDEFINED, L::TRANSFER_DST_OPTIMAL).unwrap();
        assert_eq!(m.src_access, A::empty());
        assert_eq!(m.dst_access, A::TRANSFER_WRITE);
        assert_eq!(m.src_stage, S::TOP_OF_PIPE);
        assert_eq!(m.dst_stage, S::TRANSFER);
    }

    #[test]
    fn storage_image_round_trip_through_transfer() {
        let to_src = transition_masks(L::GENERAL, L::TRANSFER_SRC_OPTIMAL).unwrap();
        assert_eq!(to_src.src_access, A::SHADER_READ | A::SHADER_WRITE);
        assert_eq!(to_src.dst_access, A::TRANSFER_READ);
        assert!(to_src.src_stage.contains(S::RAY_TRACING_SHADER_KHR));
        assert_eq!(to_src.dst_stage, S::TRANSFER);

        let back = transition_masks(L::TRANSFER_SRC_OPTIMAL, L::GENERAL).unwrap();
        assert_eq!(back.src_access, A::TRANSFER_READ);
        assert_eq!(back.dst_access, A::SHADER_READ | A::SHADER_WRITE);
        assert_eq!(back.src_stage, S::TRANSFER);
        assert_eq!(
            back.dst_stage,
            S::COMPUTE_SHADER | S::FRAGMENT_SHADER | S::RAY_TRACING_SHADER_KHR
        );
    }

    #[test]
    fn initial_storage_image_layout() {
        let m = transition_masks(L::UNDEFINED, L::GENERAL).unwrap();
        assert_eq!(m.src_access, A::empty());
        assert_eq!(m.src_stage, S::TOP_OF_PIPE);
        assert_eq!(m.dst_access, A::SHADER_READ | A::SHADER_WRITE);
    }

    #[test]
    fn every_documented_pair_is_supported() {
        let shader_rw = A::SHADER_READ | A::SHADER_WRITE;
        let shader = S::COMPUTE_SHADER | S::FRAGMENT_SHADER | S::RAY_TRACING_SHADER_KHR;
        let table = [
            (L::UNDEFINED, L::TRANSFER_DST_OPTIMAL, A::empty(), A::TRANSFER_WRITE, S::TOP_OF_PIPE, S::TRANSFER),
            (L::TRANSFER_DST_OPTIMAL, L::SHADER_READ_ONLY_OPTIMAL, A::TRANSFER_WRITE, A::SHADER_READ, S::TRANSFER, S::FRAGMENT_SHADER),
            (L::UNDEFINED, L::GENERAL, A::empty(), shader_rw, S::TOP_OF_PIPE, shader),
            (L::TRANSFER_SRC_OPTIMAL, L::TRANSFER_DST_OPTIMAL, A::TRANSFER_READ, A::TRANSFER_WRITE, S::TRANSFER, S::TRANSFER),
            (L::TRANSFER_DST_OPTIMAL, L::PRESENT_SRC_KHR, A::TRANSFER_WRITE, A::empty(), S::TRANSFER, S::BOTTOM_OF_PIPE),
            (L::TRANSFER_SRC_OPTIMAL, L::GENERAL, A::TRANSFER_READ, shader_rw, S::TRANSFER, shader),
            (L::GENERAL, L::TRANSFER_SRC_OPTIMAL, shader_rw, A::TRANSFER_READ, shader, S::TRANSFER),
            (L::PRESENT_SRC_KHR, L::TRANSFER_DST_OPTIMAL, A::MEMORY_READ, A::TRANSFER_WRITE, S::BOTTOM_OF_PIPE, S::TRANSFER),
            (
                L::TRANSFER_DST_OPTIMAL,
                L::COLOR_ATTACHMENT_OPTIMAL,
                A::TRANSFER_WRITE,
                A::COLOR_ATTACHMENT_READ | A::COLOR_ATTACHMENT_WRITE,
                S::TRANSFER,
                S::COLOR_ATTACHMENT_OUTPUT,
            ),
            (L::COLOR_ATTACHMENT_OPTIMAL, L::PRESENT_SRC_KHR, A::COLOR_ATTACHMENT_WRITE, A::empty(), S::COLOR_ATTACHMENT_OUTPUT, S::BOTTOM_OF_PIPE),
            (L::UNDEFINED, L::PRESENT_SRC_KHR, A::empty(), A::empty(), S::TOP_OF_PIPE, S::BOTTOM_OF_PIPE),
        ];

        assert_eq!(table.len(), 11);
        for (old, new, src_access, dst_access, src_stage, dst_stage) in table {
            let m = transition_masks(old, new).unwrap();
            assert_eq!(
                m,
                TransitionMasks { src_access, dst_access, src_stage, dst_stage },
                "{:?} -> {:?}",
                old,
                new
            );
        }
    }

    #[test]
    fn unsupported_pairs_are_errors() {
        assert!(transition_masks(L::GENERAL, L::PRESENT_SRC_KHR).is_err());
        assert!(transition_masks(L::SHADER_READ_ONLY_OPTIMAL, L::UNDEFINED).is_err());
        assert!(transition_masks(L::GENERAL, L::GENERAL).is_err());
        assert!(transition_masks(L::PRESENT_SRC_KHR, L::GENERAL).is_err());
    }
}
