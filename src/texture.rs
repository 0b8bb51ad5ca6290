use derive_more::Display;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Pixel formats a texture resource may be created with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum TextureFormat {
    R8Unorm,
    Rg8Unorm,
    Rgba8Unorm,
    Bgra8Unorm,
    R16Float,
    Rg16Float,
    Rgba16Float,
    R32Float,
    Rg32Float,
    Rgba32Float,
    R32Uint,
    Rgba32Uint,
}

impl TextureFormat {
    pub const fn bits_per_pixel(self) -> usize {
        match self {
            TextureFormat::R8Unorm => 8,
            TextureFormat::Rg8Unorm => 16,
            TextureFormat::R16Float => 16,
            TextureFormat::Rgba8Unorm => 32,
            TextureFormat::Bgra8Unorm => 32,
            TextureFormat::Rg16Float => 32,
            TextureFormat::R32Float => 32,
            TextureFormat::R32Uint => 32,
            TextureFormat::Rgba16Float => 64,
            TextureFormat::Rg32Float => 64,
            TextureFormat::Rgba32Float => 128,
            TextureFormat::Rgba32Uint => 128,
        }
    }

    #[inline]
    pub const fn bytes_per_pixel(self) -> usize {
        self.bits_per_pixel() / 8
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum TextureDimension {
    #[default]
    D2,
    D2Array,
    D3,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum WrapMode {
    #[default]
    Repeat,
    Clamp,
    Mirror,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum FilterMode {
    Point,
    #[default]
    Bilinear,
    Trilinear,
}

/// Creation parameters of a texture resource.
///
/// Sampling parameters (`wrap`, `filter`, `anisotropy`) and the mip count are
/// handed to the device untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct TextureDescriptor {
    pub width: u32,
    pub height: u32,
    /// Depth for 3D textures, layer count for arrays, 1 otherwise.
    pub depth: u32,
    pub format: TextureFormat,
    pub dimension: TextureDimension,
    pub mip_count: u32,
    pub wrap: WrapMode,
    pub filter: FilterMode,
    pub anisotropy: u16,
    /// The texture can be used as a render attachment.
    pub render_target: bool,
    /// The texture can be written from kernels.
    pub random_write: bool,
}

impl TextureDescriptor {
    pub fn new(width: u32, height: u32, format: TextureFormat) -> Self {
        Self {
            width: width.max(1),
            height: height.max(1),
            depth: 1,
            format,
            dimension: TextureDimension::D2,
            mip_count: 1,
            wrap: WrapMode::default(),
            filter: FilterMode::default(),
            anisotropy: 1,
            render_target: false,
            random_write: true,
        }
    }

    pub fn volume(mut self, depth: u32) -> Self {
        self.depth = depth.max(1);
        self.dimension = TextureDimension::D3;
        self
    }

    pub fn layers(mut self, layers: u32) -> Self {
        self.depth = layers.max(1);
        self.dimension = TextureDimension::D2Array;
        self
    }

    pub fn mip_count(mut self, mip_count: u32) -> Self {
        self.mip_count = mip_count.max(1);
        self
    }

    pub fn wrap(mut self, wrap: WrapMode) -> Self {
        self.wrap = wrap;
        self
    }

    pub fn filter(mut self, filter: FilterMode) -> Self {
        self.filter = filter;
        self
    }

    pub fn anisotropy(mut self, anisotropy: u16) -> Self {
        self.anisotropy = anisotropy;
        self
    }

    pub fn render_target(mut self, render_target: bool) -> Self {
        self.render_target = render_target;
        self
    }

    pub fn random_write(mut self, random_write: bool) -> Self {
        self.random_write = random_write;
        self
    }

    /// Bytes occupied by the base level, as accounted by the memory ledger.
    #[inline]
    pub const fn pixel_bytes(&self) -> usize {
        let pixels = self.width as usize * self.height as usize * self.depth as usize;
        pixels * self.format.bits_per_pixel() / 8
    }

    /// Extent of a mip level. Array layers do not shrink.
    pub fn mip_extent(&self, mip: u32) -> [u32; 3] {
        let shrink = |x: u32| x.checked_shr(mip).unwrap_or(0).max(1);
        let depth = match self.dimension {
            TextureDimension::D3 => shrink(self.depth),
            _ => self.depth,
        };
        [shrink(self.width), shrink(self.height), depth]
    }

    /// Checks that a region starts inside the texture and does not run past any edge.
    pub fn contains(&self, region: &TextureRegion) -> bool {
        if region.mip >= self.mip_count {
            return false;
        }
        let [width, height, depth] = self.mip_extent(region.mip);
        let fits = |origin: u32, size: u32, extent: u32| {
            origin < extent && (origin as u64 + size as u64) <= extent as u64
        };
        fits(region.x, region.width, width)
            && fits(region.y, region.height, height)
            && fits(region.z, region.depth, depth)
    }
}

/// A box inside one mip level of a texture.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[display("({x}, {y}, {z}) + [{width}, {height}, {depth}] @ mip {mip}")]
pub struct TextureRegion {
    pub x: u32,
    pub y: u32,
    pub z: u32,
    pub width: u32,
    pub height: u32,
    pub depth: u32,
    pub mip: u32,
}

impl TextureRegion {
    /// The whole base level of a texture.
    pub fn full(descriptor: &TextureDescriptor) -> Self {
        Self {
            x: 0,
            y: 0,
            z: 0,
            width: descriptor.width,
            height: descriptor.height,
            depth: descriptor.depth,
            mip: 0,
        }
    }

    #[inline]
    pub const fn texel_count(&self) -> usize {
        self.width as usize * self.height as usize * self.depth as usize
    }
}

/// Host-side pixel storage, tightly packed row by row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextureData {
    pub width: u32,
    pub height: u32,
    pub depth: u32,
    pub format: TextureFormat,
    pub bytes: Vec<u8>,
}

impl TextureData {
    pub fn new(width: u32, height: u32, depth: u32, format: TextureFormat) -> Self {
        let len = width as usize * height as usize * depth as usize * format.bytes_per_pixel();
        Self {
            width,
            height,
            depth,
            format,
            bytes: vec![0; len],
        }
    }

    /// Reinterprets the pixels as `T`. Returns `None` if sizes do not line up.
    pub fn pixels<T: bytemuck::Pod>(&self) -> Option<Vec<T>> {
        if size_of::<T>() == 0 || self.bytes.len() % size_of::<T>() != 0 {
            return None;
        }
        Some(bytemuck::pod_collect_to_vec(&self.bytes))
    }
}
