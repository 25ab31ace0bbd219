// Geometry uploaded once at startup and drawn every frame

use anyhow::{Context, Result};
use ash::vk;
use bytemuck::{Pod, Zeroable};
use glam::{Vec2, Vec3};
use std::mem::{offset_of, size_of};
use std::sync::Arc;
use crate::backend::buffer::AllocatedBuffer;
use crate::backend::VulkanDevice;

/// 2D position + RGB color, laid out exactly as the vertex shader reads it
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct Vertex {
    pub position: Vec2,
    pub color: Vec3,
}

impl Vertex {
    pub const fn new(position: Vec2, color: Vec3) -> Self {
        Self { position, color }
    }

    pub fn binding_descriptions() -> Vec<vk::VertexInputBindingDescription> {
        vec![vk::VertexInputBindingDescription {
            binding: 0,
            stride: size_of::<Vertex>() as u32,
            input_rate: vk::VertexInputRate::VERTEX,
        }]
    }

    pub fn attribute_descriptions() -> Vec<vk::VertexInputAttributeDescription> {
        vec![
            vk::VertexInputAttributeDescription {
                binding: 0,
                location: 0,
                format: vk::Format::R32G32_SFLOAT,
                offset: offset_of!(Vertex, position) as u32,
            },
            vk::VertexInputAttributeDescription {
                binding: 0,
                location: 1,
                format: vk::Format::R32G32B32_SFLOAT,
                offset: offset_of!(Vertex, color) as u32,
            },
        ]
    }
}

/// A vertex buffer plus the number of vertices to draw from it
pub struct Model {
    vertex_buffer: AllocatedBuffer,
    vertex_count: u32,
    device: Arc<VulkanDevice>,
}

impl Model {
    pub fn new(device: Arc<VulkanDevice>, vertices: &[Vertex]) -> Result<Self> {
        if vertices.len() < 3 {
            anyhow::bail!("Vertex count must be at least 3, got {}", vertices.len());
        }

        let vertex_buffer = AllocatedBuffer::with_data(
            device.clone(),
            "vertex_buffer",
            vk::BufferUsageFlags::VERTEX_BUFFER,
            vertices,
        )?;

        let model = Self {
            vertex_buffer,
            vertex_count: u32::try_from(vertices.len()).context("Too many vertices")?,
            device,
        };

        log::info!(
            "Uploaded model: {} vertices ({} bytes)",
            model.vertex_count(),
            model.vertex_buffer.size
        );

        Ok(model)
    }

    pub fn vertex_count(&self) -> u32 {
        self.vertex_count
    }

    pub fn bind(&self, command_buffer: vk::CommandBuffer) {
        unsafe {
            self.device.device.cmd_bind_vertex_buffers(
                command_buffer,
                0,
                &[self.vertex_buffer.buffer],
                &[0],
            );
        }
    }

    pub fn draw(&self, command_buffer: vk::CommandBuffer) {
        unsafe {
            self.device
                .device
                .cmd_draw(command_buffer, self.vertex_count, 1, 0, 0);
        }
    }
}

/// The classic red/green/blue triangle
pub fn triangle() -> Vec<Vertex> {
    vec![
        Vertex::new(Vec2::new(0.0, -0.5), Vec3::new(1.0, 0.0, 0.0)),
        Vertex::new(Vec2::new(0.5, 0.5), Vec3::new(0.0, 1.0, 0.0)),
        Vertex::new(Vec2::new(-0.5, 0.5), Vec3::new(0.0, 0.0, 1.0)),
    ]
}

/// Deepest Sierpinski subdivision we generate (3^10 triangles)
pub const MAX_SIERPINSKI_DEPTH: u32 = 10;

/// Sierpinski triangle with `depth` levels of subdivision, in white.
/// Emits `3^depth` triangles.
pub fn sierpinski(depth: u32, top: Vec2, right: Vec2, left: Vec2) -> Result<Vec<Vertex>> {
    if depth > MAX_SIERPINSKI_DEPTH {
        anyhow::bail!(
            "Sierpinski depth {} exceeds the maximum of {}",
            depth,
            MAX_SIERPINSKI_DEPTH
        );
    }
    let vertex_count = 3usize
        .checked_pow(depth)
        .and_then(|triangles| triangles.checked_mul(3))
        .context("Sierpinski vertex count overflows")?;

    let mut vertices = Vec::with_capacity(vertex_count);
    subdivide(&mut vertices, depth, top, right, left);
    Ok(vertices)
}

fn subdivide(vertices: &mut Vec<Vertex>, depth: u32, top: Vec2, right: Vec2, left: Vec2) {
    if depth == 0 {
        vertices.extend([top, right, left].map(|p| Vertex::new(p, Vec3::ONE)));
        return;
    }

    let left_mid = top.lerp(left, 0.5);
    let right_mid = top.lerp(right, 0.5);
    let bottom_mid = left.lerp(right, 0.5);

    subdivide(vertices, depth - 1, top, right_mid, left_mid);
    subdivide(vertices, depth - 1, right_mid, right, bottom_mid);
    subdivide(vertices, depth - 1, left_mid, bottom_mid, left);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vertex_layout_matches_descriptions() {
        assert_eq!(size_of::<Vertex>(), 20);

        let bindings = Vertex::binding_descriptions();
        assert_eq!(bindings.len(), 1);
        assert_eq!(bindings[0].stride, 20);
        assert_eq!(bindings[0].input_rate, vk::VertexInputRate::VERTEX);

        let attributes = Vertex::attribute_descriptions();
        assert_eq!(attributes.len(), 2);
        assert_eq!((attributes[0].location, attributes[0].offset), (0, 0));
        assert_eq!(attributes[0].format, vk::Format::R32G32_SFLOAT);
        assert_eq!((attributes[1].location, attributes[1].offset), (1, 8));
        assert_eq!(attributes[1].format, vk::Format::R32G32B32_SFLOAT);
    }

    #[test]
    fn vertices_are_tightly_packed_floats() {
        let vertices = triangle();
        let bytes: &[u8] = bytemuck::cast_slice(&vertices);
        assert_eq!(bytes.len(), 3 * 20);
        let floats: &[f32] = bytemuck::cast_slice(bytes);
        assert_eq!(&floats[..5], &[0.0, -0.5, 1.0, 0.0, 0.0]);
    }

    #[test]
    fn triangle_is_rgb() {
        let vertices = triangle();
        assert_eq!(vertices.len(), 3);
        assert_eq!(vertices[0].color, Vec3::X);
        assert_eq!(vertices[1].color, Vec3::Y);
        assert_eq!(vertices[2].color, Vec3::Z);
    }

    #[test]
    fn sierpinski_depth_zero_is_the_input_triangle() {
        let (top, right, left) = (Vec2::new(0.0, -0.5), Vec2::new(0.5, 0.5), Vec2::new(-0.5, 0.5));
        let vertices = sierpinski(0, top, right, left).unwrap();
        let positions: Vec<_> = vertices.iter().map(|v| v.position).collect();
        assert_eq!(positions, vec![top, right, left]);
        assert!(vertices.iter().all(|v| v.color == Vec3::ONE));
    }

    #[test]
    fn sierpinski_triples_per_level() {
        let (top, right, left) = (Vec2::new(0.0, -0.5), Vec2::new(0.5, 0.5), Vec2::new(-0.5, 0.5));
        for depth in 0..5 {
            assert_eq!(sierpinski(depth, top, right, left).unwrap().len(), 3 * 3usize.pow(depth));
        }
    }

    #[test]
    fn sierpinski_rejects_excessive_depth() {
        let (top, right, left) = (Vec2::new(0.0, -0.5), Vec2::new(0.5, 0.5), Vec2::new(-0.5, 0.5));
        assert!(sierpinski(MAX_SIERPINSKI_DEPTH + 1, top, right, left).is_err());
        assert!(sierpinski(41, top, right, left).is_err());
        assert!(sierpinski(u32::MAX, top, right, left).is_err());
    }

    #[test]
    fn sierpinski_first_level_uses_midpoints() {
        let (top, right, left) = (Vec2::new(0.0, -1.0), Vec2::new(1.0, 1.0), Vec2::new(-1.0, 1.0));
        let vertices = sierpinski(1, top, right, left).unwrap();
        // Top sub-triangle: top, right midpoint, left midpoint
        assert_eq!(vertices[0].position, top);
        assert_eq!(vertices[1].position, Vec2::new(0.5, 0.0));
        assert_eq!(vertices[2].position, Vec2::new(-0.5, 0.0));
        // Right sub-triangle ends at the bottom midpoint
        assert_eq!(vertices[5].position, Vec2::new(0.0, 1.0));
    }
}
