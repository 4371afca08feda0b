// image.rs — Runtime-sized single-channel f32 image.
//
// The whole detector operates on grayscale f32 grids normalised to [0, 1]:
// blur accumulation, DoG subtraction and the quadratic fit all need signed
// floating-point pixels, so there is no reason to carry other pixel types
// through the pipeline. 8-bit input is converted once at ingestion via
// `from_u8_normalized`.
//
// Rows are stored contiguously (no stride padding); the GPU upload path in
// gpu/slice.rs re-pads rows to wgpu's 256-byte copy alignment itself.

use std::fmt;

/// A single-channel f32 image with runtime dimensions, row-major.
pub struct Image {
    /// Pixel data, length = width * height.
    data: Vec<f32>,
    width: usize,
    height: usize,
}

// Clone is a deep copy of the pixel buffer — implemented explicitly rather
// than derived to make the cost visible at the call site.
impl Clone for Image {
    fn clone(&self) -> Self {
        Image {
            data: self.data.clone(),
            width: self.width,
            height: self.height,
        }
    }
}

impl Image {
    /// Create a zero-filled image.
    pub fn new(width: usize, height: usize) -> Self {
        Image {
            data: vec![0.0; width * height],
            width,
            height,
        }
    }

    /// Create an image from an existing pixel vector.
    ///
    /// # Panics
    /// Panics if `data.len() != width * height`.
    pub fn from_vec(width: usize, height: usize, data: Vec<f32>) -> Self {
        assert_eq!(
            data.len(),
            width * height,
            "data length ({}) must equal width * height ({})",
            data.len(),
            width * height,
        );
        Image { data, width, height }
    }

    /// Convert 8-bit grayscale to the [0, 1] range the detector expects.
    /// u8 0 → 0.0, u8 255 → 1.0.
    ///
    /// # Panics
    /// Panics if `data.len() != width * height`.
    pub fn from_u8_normalized(width: usize, height: usize, data: &[u8]) -> Self {
        assert_eq!(
            data.len(),
            width * height,
            "data length ({}) must equal width * height ({})",
            data.len(),
            width * height,
        );
        let pixels = data.iter().map(|&v| v as f32 / 255.0).collect();
        Image::from_vec(width, height, pixels)
    }

    #[inline]
    pub fn width(&self) -> usize {
        self.width
    }

    #[inline]
    pub fn height(&self) -> usize {
        self.height
    }

    /// Get the pixel value at (x, y). x is column, y is row.
    ///
    /// # Panics
    /// Panics if (x, y) is out of bounds.
    #[inline]
    pub fn get(&self, x: usize, y: usize) -> f32 {
        self.bounds_check(x, y);
        self.data[y * self.width + x]
    }

    /// Get a pixel without bounds checking.
    ///
    /// # Safety
    /// Caller must guarantee x < width and y < height. Used in hot inner
    /// loops (convolution, extrema scan) where bounds are validated at the
    /// loop level.
    #[inline(always)]
    pub unsafe fn get_unchecked(&self, x: usize, y: usize) -> f32 {
        debug_assert!(
            x < self.width && y < self.height,
            "get_unchecked({x},{y}) out of bounds for {}x{}",
            self.width,
            self.height
        );
        *self.data.get_unchecked(y * self.width + x)
    }

    /// Set the pixel at (x, y).
    #[inline]
    pub fn set(&mut self, x: usize, y: usize, value: f32) {
        self.bounds_check(x, y);
        self.data[y * self.width + x] = value;
    }

    /// Set a pixel without bounds checking.
    ///
    /// # Safety
    /// Caller must guarantee x < width and y < height.
    #[inline(always)]
    pub unsafe fn set_unchecked(&mut self, x: usize, y: usize, value: f32) {
        debug_assert!(x < self.width && y < self.height);
        *self.data.get_unchecked_mut(y * self.width + x) = value;
    }

    /// Iterate over all pixels as `(x, y, value)` tuples, row-major.
    pub fn pixels(&self) -> impl Iterator<Item = (usize, usize, f32)> + '_ {
        (0..self.height)
            .flat_map(move |y| (0..self.width).map(move |x| (x, y, self.data[y * self.width + x])))
    }

    /// The underlying data as a flat row-major slice.
    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }

    /// Mutable access to the underlying data.
    pub fn as_mut_slice(&mut self) -> &mut [f32] {
        &mut self.data
    }

    #[inline]
    fn bounds_check(&self, x: usize, y: usize) {
        assert!(
            x < self.width && y < self.height,
            "pixel ({x},{y}) out of bounds for image {}×{}",
            self.width,
            self.height,
        );
    }
}

impl fmt::Debug for Image {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Image {{ {}×{} }}", self.width, self.height)?;
        for y in 0..self.height.min(8) {
            write!(f, "  row {y}: [")?;
            for x in 0..self.width.min(12) {
                if x > 0 {
                    write!(f, ", ")?;
                }
                write!(f, "{:.4}", self.get(x, y))?;
            }
            if self.width > 12 {
                write!(f, ", ...")?;
            }
            writeln!(f, "]")?;
        }
        if self.height > 8 {
            writeln!(f, "  ...")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_zero_filled() {
        let img = Image::new(10, 5);
        assert_eq!(img.width(), 10);
        assert_eq!(img.height(), 5);
        for (_, _, v) in img.pixels() {
            assert_eq!(v, 0.0);
        }
    }

    #[test]
    fn test_roundtrip() {
        let mut img = Image::new(4, 3);
        img.set(0, 0, 0.25);
        img.set(3, 2, 1.0);
        img.set(1, 1, -0.5); // DoG pixels are signed
        assert_eq!(img.get(0, 0), 0.25);
        assert_eq!(img.get(3, 2), 1.0);
        assert_eq!(img.get(1, 1), -0.5);
        assert_eq!(img.get(2, 2), 0.0);
    }

    #[test]
    fn test_from_vec_layout() {
        let data: Vec<f32> = (0..12).map(|v| v as f32).collect();
        let img = Image::from_vec(4, 3, data);
        assert_eq!(img.get(0, 0), 0.0);
        assert_eq!(img.get(3, 0), 3.0);
        assert_eq!(img.get(0, 1), 4.0);
        assert_eq!(img.get(3, 2), 11.0);
    }

    #[test]
    fn test_from_u8_normalized() {
        let img = Image::from_u8_normalized(2, 2, &[0, 51, 204, 255]);
        assert!((img.get(0, 0) - 0.0).abs() < 1e-6);
        assert!((img.get(1, 0) - 0.2).abs() < 1e-6);
        assert!((img.get(0, 1) - 0.8).abs() < 1e-6);
        assert!((img.get(1, 1) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_pixels_iterator_order() {
        let data: Vec<f32> = (0..6).map(|v| v as f32).collect();
        let img = Image::from_vec(3, 2, data);
        let pixels: Vec<_> = img.pixels().collect();
        assert_eq!(pixels.len(), 6);
        assert_eq!(pixels[0], (0, 0, 0.0));
        assert_eq!(pixels[2], (2, 0, 2.0));
        assert_eq!(pixels[3], (0, 1, 3.0));
    }

    #[test]
    #[should_panic(expected = "out of bounds")]
    fn test_get_out_of_bounds() {
        let img = Image::new(4, 4);
        img.get(4, 0);
    }

    #[test]
    #[should_panic(expected = "width * height")]
    fn test_from_vec_wrong_length() {
        Image::from_vec(4, 4, vec![0.0; 15]);
    }
}
