/// Mount-time knobs.
#[derive(Clone, Debug)]
pub struct FsConfig {
    /// Inodes to format an unformatted device with.
    pub default_inodes: u32,
    /// Capacity of the block cache, in blocks.
    pub cache_blocks: usize,
    /// Format unformatted devices in `FileSystem::mount` instead of
    /// failing with `FsError::Corrupted`.
    pub format_on_mount: bool,
}

impl Default for FsConfig {
    fn default() -> Self {
        Self {
            default_inodes: 64,
            cache_blocks: 128,
            format_on_mount: true,
        }
    }
}

impl FsConfig {
    pub fn with_default_inodes(mut self, inodes: u32) -> Self {
        self.default_inodes = inodes;
        self
    }

    pub fn with_cache_blocks(mut self, blocks: usize) -> Self {
        self.cache_blocks = blocks;
        self
    }

    pub fn with_format_on_mount(mut self, format: bool) -> Self {
        self.format_on_mount = format;
        self
    }
}
