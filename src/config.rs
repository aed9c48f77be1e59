//! Configuration shared by every buffer created through a manager.

/// Tuning for buffer allocation.
#[derive(Debug, Clone, PartialEq)]
pub struct BufferCacheConfig {
    /// Capacity multiplier applied when a dynamic buffer must grow
    pub dynamic_growth_factor: f32,
    /// Minimum element capacity of a dynamic buffer
    pub min_dynamic_capacity: usize,
    /// Attach debug labels to created buffers
    pub label_buffers: bool,
}

impl BufferCacheConfig {
    /// Element capacity for a dynamic buffer that must hold `count` elements.
    pub fn dynamic_capacity(&self, count: usize) -> usize {
        let grown = (count as f64 * self.dynamic_growth_factor.max(1.0) as f64).ceil() as usize;
        grown.max(count).max(self.min_dynamic_capacity)
    }
}

impl Default for BufferCacheConfig {
    fn default() -> Self {
        Self {
            dynamic_growth_factor: 1.5,
            min_dynamic_capacity: 64,
            label_buffers: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dynamic_capacity() {
        let config = BufferCacheConfig::default();
        assert_eq!(config.dynamic_capacity(10), 64);
        assert_eq!(config.dynamic_capacity(100), 150);

        let tight = BufferCacheConfig {
            dynamic_growth_factor: 0.5,
            min_dynamic_capacity: 0,
            ..Default::default()
        };
        assert_eq!(tight.dynamic_capacity(7), 7);
    }
}
