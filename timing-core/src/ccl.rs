//! # ccl
//!
//! Run-based connected-component labelling over the binary motion mask.
//!
//! Row runs are extracted first, then merged across rows with a union-find
//! (path compression). All buffers are sized once at construction and reused
//! every frame; after warm-up the labeller performs no allocation at 60 fps.
//!
//! ## Invariants
//! - 8-connectivity: runs in adjacent rows merge when their column intervals
//!   touch or overlap by one.
//! - Blob statistics (bbox, area-weighted centroid) are exact, not sampled.

/// One maximal horizontal run of set mask pixels.
#[derive(Debug, Clone, Copy)]
struct Run {
    row: u16,
    x0: u16,
    /// Inclusive.
    x1: u16,
}

/// Summary of one connected component.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Blob {
    pub min_x: u16,
    pub min_y: u16,
    pub max_x: u16,
    pub max_y: u16,
    pub area: u32,
    sum_x: u64,
    sum_y: u64,
}

impl Blob {
    fn empty() -> Self {
        Self {
            min_x: u16::MAX,
            min_y: u16::MAX,
            max_x: 0,
            max_y: 0,
            area: 0,
            sum_x: 0,
            sum_y: 0,
        }
    }

    fn absorb(&mut self, run: &Run) {
        let len = (run.x1 - run.x0 + 1) as u32;
        self.min_x = self.min_x.min(run.x0);
        self.max_x = self.max_x.max(run.x1);
        self.min_y = self.min_y.min(run.row);
        self.max_y = self.max_y.max(run.row);
        self.area += len;
        // Sum of x over [x0, x1] = len * (x0 + x1) / 2, exact for integers
        self.sum_x += len as u64 * (run.x0 as u64 + run.x1 as u64) / 2;
        self.sum_y += run.row as u64 * len as u64;
    }

    /// Area-weighted centroid.
    pub fn centroid(&self) -> (f32, f32) {
        if self.area == 0 {
            return (0.0, 0.0);
        }
        (
            self.sum_x as f32 / self.area as f32,
            self.sum_y as f32 / self.area as f32,
        )
    }

    pub fn width(&self) -> u16 {
        self.max_x - self.min_x + 1
    }

    pub fn height(&self) -> u16 {
        self.max_y - self.min_y + 1
    }

    /// Bounding-box height as a fraction of the frame height.
    pub fn height_fraction(&self, frame_height: usize) -> f32 {
        self.height() as f32 / frame_height as f32
    }
}

/// Reusable labeller for a fixed work resolution.
pub struct ConnectedComponents {
    width: usize,
    height: usize,
    runs: Vec<Run>,
    /// Union-find parents over run indices.
    parent: Vec<u32>,
    /// First run index of the previous row (runs are stored row-major).
    blob_of_root: Vec<u32>,
    blobs: Vec<Blob>,
}

impl ConnectedComponents {
    pub fn new(width: usize, height: usize) -> Self {
        // Worst case: alternating pixels, width/2 + 1 runs per row.
        let max_runs = (width / 2 + 1) * height;
        Self {
            width,
            height,
            runs: Vec::with_capacity(max_runs),
            parent: Vec::with_capacity(max_runs),
            blob_of_root: Vec::with_capacity(max_runs),
            blobs: Vec::with_capacity(64),
        }
    }

    fn find(&mut self, mut i: u32) -> u32 {
        while self.parent[i as usize] != i {
            // Path halving
            let grand = self.parent[self.parent[i as usize] as usize];
            self.parent[i as usize] = grand;
            i = grand;
        }
        i
    }

    fn union(&mut self, a: u32, b: u32) {
        let ra = self.find(a);
        let rb = self.find(b);
        if ra != rb {
            // Attach the larger index under the smaller for stable roots
            if ra < rb {
                self.parent[rb as usize] = ra;
            } else {
                self.parent[ra as usize] = rb;
            }
        }
    }

    /// Label `mask` (0/1 per pixel, row-major, `width * height` long) and
    /// return the blobs found. The returned slice is valid until the next
    /// call; buffers are reused.
    pub fn label(&mut self, mask: &[u8]) -> &[Blob] {
        debug_assert_eq!(mask.len(), self.width * self.height);
        self.runs.clear();
        self.parent.clear();
        self.blobs.clear();

        let mut prev_row_start = 0usize;
        let mut prev_row_end = 0usize; // exclusive

        for row in 0..self.height {
            let row_base = row * self.width;
            let this_row_start = self.runs.len();
            let mut x = 0usize;
            while x < self.width {
                if mask[row_base + x] == 0 {
                    x += 1;
                    continue;
                }
                let x0 = x;
                while x < self.width && mask[row_base + x] != 0 {
                    x += 1;
                }
                let run_idx = self.runs.len() as u32;
                self.runs.push(Run {
                    row: row as u16,
                    x0: x0 as u16,
                    x1: (x - 1) as u16,
                });
                self.parent.push(run_idx);

                // Merge with overlapping runs of the previous row.
                // 8-connectivity: intervals touching diagonally also merge,
                // so the test is prev.x0 <= x1+1 && prev.x1+1 >= x0
                // (here `x` already equals x1 + 1).
                for prev_idx in prev_row_start..prev_row_end {
                    let prev = self.runs[prev_idx];
                    if prev.x0 as usize <= x && prev.x1 as usize + 1 >= x0 {
                        self.union(run_idx, prev_idx as u32);
                    }
                }
            }
            prev_row_start = this_row_start;
            prev_row_end = self.runs.len();
        }

        // Accumulate statistics per root
        self.blob_of_root.clear();
        self.blob_of_root.resize(self.runs.len(), u32::MAX);
        for i in 0..self.runs.len() as u32 {
            let root = self.find(i);
            let slot = self.blob_of_root[root as usize];
            let blob_idx = if slot == u32::MAX {
                let idx = self.blobs.len() as u32;
                self.blobs.push(Blob::empty());
                self.blob_of_root[root as usize] = idx;
                idx
            } else {
                slot
            };
            let run = self.runs[i as usize];
            self.blobs[blob_idx as usize].absorb(&run);
        }

        &self.blobs
    }

    /// Largest blob by pixel area, if any.
    pub fn largest(&self) -> Option<&Blob> {
        self.blobs.iter().max_by_key(|b| b.area)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mask_from(rows: &[&str]) -> (Vec<u8>, usize, usize) {
        let height = rows.len();
        let width = rows[0].len();
        let mut mask = vec![0u8; width * height];
        for (y, row) in rows.iter().enumerate() {
            for (x, c) in row.chars().enumerate() {
                if c == '#' {
                    mask[y * width + x] = 1;
                }
            }
        }
        (mask, width, height)
    }

    #[test]
    fn single_rectangle_is_one_blob() {
        let (mask, w, h) = mask_from(&[
            "........",
            ".####...",
            ".####...",
            ".####...",
            "........",
        ]);
        let mut ccl = ConnectedComponents::new(w, h);
        let blobs = ccl.label(&mask);
        assert_eq!(blobs.len(), 1);
        let b = &blobs[0];
        assert_eq!(b.area, 12);
        assert_eq!((b.min_x, b.min_y, b.max_x, b.max_y), (1, 1, 4, 3));
        let (cx, cy) = b.centroid();
        assert!((cx - 2.5).abs() < 1e-4);
        assert!((cy - 2.0).abs() < 1e-4);
    }

    #[test]
    fn separate_regions_get_separate_blobs() {
        let (mask, w, h) = mask_from(&[
            "##....##",
            "##....##",
            "........",
            "...#....",
        ]);
        let mut ccl = ConnectedComponents::new(w, h);
        let blobs = ccl.label(&mask);
        assert_eq!(blobs.len(), 3);
        assert_eq!(ccl.largest().unwrap().area, 4);
    }

    #[test]
    fn diagonal_touch_merges_with_eight_connectivity() {
        let (mask, w, h) = mask_from(&[
            "##......",
            "..##....",
            "....##..",
        ]);
        let mut ccl = ConnectedComponents::new(w, h);
        let blobs = ccl.label(&mask);
        assert_eq!(blobs.len(), 1);
        assert_eq!(blobs[0].area, 6);
    }

    #[test]
    fn u_shape_merges_into_one_blob() {
        // The two arms only join at the bottom row; the union-find must
        // merge the provisional labels.
        let (mask, w, h) = mask_from(&[
            "#....#",
            "#....#",
            "######",
        ]);
        let mut ccl = ConnectedComponents::new(w, h);
        let blobs = ccl.label(&mask);
        assert_eq!(blobs.len(), 1);
        assert_eq!(blobs[0].area, 10);
        assert_eq!(blobs[0].height(), 3);
    }

    #[test]
    fn relabelling_reuses_buffers() {
        let (mask, w, h) = mask_from(&["####", "####"]);
        let mut ccl = ConnectedComponents::new(w, h);
        assert_eq!(ccl.label(&mask).len(), 1);
        let empty = vec![0u8; w * h];
        assert_eq!(ccl.label(&empty).len(), 0);
        assert_eq!(ccl.label(&mask).len(), 1);
    }
}
