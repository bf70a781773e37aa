//! Resource Grid for 5G NR
//!
//! Slot-sized grid of resource elements, indexed `[port][symbol][subcarrier]`,
//! and a fixed-capacity pool that hands grids out and takes them back when
//! the last user drops them.

use ndarray::{Array3, ArrayView1, ArrayViewMut1};
use num_complex::Complex32;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex};
use tracing::trace;

/// Resource grid for one slot
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceGrid {
    /// 3D grid: [ports, symbols, subcarriers]
    grid: Array3<Complex32>,
}

impl ResourceGrid {
    /// Create a new zeroed resource grid
    pub fn new(nof_ports: usize, nof_symbols: usize, nof_subc: usize) -> Self {
        Self {
            grid: Array3::zeros((nof_ports, nof_symbols, nof_subc)),
        }
    }

    pub fn nof_ports(&self) -> usize {
        self.grid.shape()[0]
    }

    pub fn nof_symbols(&self) -> usize {
        self.grid.shape()[1]
    }

    pub fn nof_subc(&self) -> usize {
        self.grid.shape()[2]
    }

    /// Read one resource element
    pub fn get(&self, port: usize, symbol: usize, subcarrier: usize) -> Complex32 {
        self.grid[[port, symbol, subcarrier]]
    }

    /// Write one resource element
    pub fn put(&mut self, port: usize, symbol: usize, subcarrier: usize, value: Complex32) {
        self.grid[[port, symbol, subcarrier]] = value;
    }

    /// All subcarriers of one symbol
    pub fn symbol(&self, port: usize, symbol: usize) -> ArrayView1<'_, Complex32> {
        self.grid.slice(ndarray::s![port, symbol, ..])
    }

    pub fn symbol_mut(&mut self, port: usize, symbol: usize) -> ArrayViewMut1<'_, Complex32> {
        self.grid.slice_mut(ndarray::s![port, symbol, ..])
    }

    pub fn set_all_zero(&mut self) {
        self.grid.fill(Complex32::new(0.0, 0.0));
    }

    /// Checks whether a port carries nothing in a symbol
    pub fn is_symbol_empty(&self, port: usize, symbol: usize) -> bool {
        self.symbol(port, symbol).iter().all(|re| re.re == 0.0 && re.im == 0.0)
    }
}

/// Fixed set of preallocated resource grids
pub struct ResourceGridPool {
    grids: Mutex<Vec<ResourceGrid>>,
    capacity: usize,
}

impl ResourceGridPool {
    pub fn new(capacity: usize, nof_ports: usize, nof_symbols: usize, nof_subc: usize) -> Arc<Self> {
        let grids = (0..capacity)
            .map(|_| ResourceGrid::new(nof_ports, nof_symbols, nof_subc))
            .collect();
        Arc::new(Self {
            grids: Mutex::new(grids),
            capacity,
        })
    }

    /// Take a zeroed grid, or `None` when every grid is in use
    pub fn get(self: &Arc<Self>) -> Option<PooledGrid> {
        let mut grid = self.grids.lock().ok()?.pop()?;
        grid.set_all_zero();
        Some(PooledGrid {
            grid: Some(grid),
            pool: Some(self.clone()),
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn available(&self) -> usize {
        self.grids.lock().map_or(0, |grids| grids.len())
    }

    fn give_back(&self, grid: ResourceGrid) {
        if let Ok(mut grids) = self.grids.lock() {
            grids.push(grid);
            trace!("Resource grid returned, {} of {} available", grids.len(), self.capacity);
        }
    }
}

/// Resource grid on loan from a pool; returns there on drop
pub struct PooledGrid {
    grid: Option<ResourceGrid>,
    pool: Option<Arc<ResourceGridPool>>,
}

impl PooledGrid {
    /// Wrap a grid that does not belong to any pool
    pub fn detached(grid: ResourceGrid) -> Self {
        Self {
            grid: Some(grid),
            pool: None,
        }
    }
}

impl Deref for PooledGrid {
    type Target = ResourceGrid;

    fn deref(&self) -> &ResourceGrid {
        // Only `drop` takes the grid out
        self.grid.as_ref().unwrap_or_else(|| unreachable!())
    }
}

impl DerefMut for PooledGrid {
    fn deref_mut(&mut self) -> &mut ResourceGrid {
        self.grid.as_mut().unwrap_or_else(|| unreachable!())
    }
}

impl Drop for PooledGrid {
    fn drop(&mut self) {
        if let (Some(grid), Some(pool)) = (self.grid.take(), self.pool.take()) {
            pool.give_back(grid);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_grid_access() {
        let mut grid = ResourceGrid::new(2, 14, 624);
        assert_eq!((grid.nof_ports(), grid.nof_symbols(), grid.nof_subc()), (2, 14, 624));
        assert!(grid.is_symbol_empty(1, 3));
        grid.put(1, 3, 100, Complex32::new(1.0, 0.5));
        assert_eq!(grid.get(1, 3, 100), Complex32::new(1.0, 0.5));
        assert_eq!(grid.symbol(1, 3)[100], Complex32::new(1.0, 0.5));
        assert!(!grid.is_symbol_empty(1, 3));
        grid.symbol_mut(0, 0).fill(Complex32::new(2.0, 0.0));
        assert_eq!(grid.get(0, 0, 623), Complex32::new(2.0, 0.0));
        grid.set_all_zero();
        assert!(grid.is_symbol_empty(0, 0));
    }

    #[test]
    fn test_pool_returns_grid_on_drop() {
        let pool = ResourceGridPool::new(2, 1, 14, 12);
        let mut a = pool.get().unwrap();
        a.put(0, 0, 0, Complex32::new(1.0, 1.0));
        let b = pool.get().unwrap();
        assert!(pool.get().is_none());
        drop(a);
        assert_eq!(pool.available(), 1);
        // Grids come back zeroed
        let c = pool.get().unwrap();
        assert!(c.is_symbol_empty(0, 0));
        drop(b);
        drop(c);
        assert_eq!(pool.available(), pool.capacity());
    }

    #[test]
    fn test_detached_grid() {
        let grid = PooledGrid::detached(ResourceGrid::new(1, 14, 12));
        assert_eq!(grid.nof_symbols(), 14);
    }
}
