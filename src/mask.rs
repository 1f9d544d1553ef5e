use ndarray::{Array2, Zip};

// returns 1.0 if greater than nominal, with a soft transition of a distance of 1.0 straddling the nominal transition.
fn soft_greater_than(x: f64, x_nominal: f64, pitch: f64) -> f64 {
    if x < x_nominal - 0.5 * pitch {
        0.0
    } else if x > x_nominal + 0.5 * pitch {
        1.0
    } else {
        (x - (x_nominal - 0.5 * pitch)) / pitch
    }
}

/// Occupancy image of a disk on a `height` x `width` pixel grid.
///
/// Pixel `(y, x)` is sampled at integer coordinates. Values are in `[0, 1]`.
/// Without antialiasing a pixel is 1.0 when its distance to the center is at most `radius`.
/// With antialiasing the occupancy falls linearly from 1.0 to 0.0 over one pixel straddling the radius,
/// so pixels further than `radius + 0.5` are exactly zero.
///
/// The result only depends on the distance to the center, so mirrored disks give mirrored images.
pub fn circular(
    center_x: f64,
    center_y: f64,
    width: usize,
    height: usize,
    radius: f64,
    antialiased: bool,
) -> Array2<f64> {
    let mut mask = Array2::zeros([height, width]);

    Zip::indexed(&mut mask).par_for_each(|(y, x), e| {
        let y0 = y as f64 - center_y;
        let x0 = x as f64 - center_x;
        let r = (x0 * x0 + y0 * y0).sqrt();

        *e = if antialiased {
            1.0 - soft_greater_than(r, radius, 1.0)
        } else if r <= radius {
            1.0
        } else {
            0.0
        };
    });

    mask
}
