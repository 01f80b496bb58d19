//! Development stand-ins used while a model handle is absent.

use image::DynamicImage;
use rand::Rng;
use std::time::Duration;

fn simulate_work(delay: Duration) {
    if !delay.is_zero() {
        std::thread::sleep(delay);
    }
}

/// Identity pass-through.
pub fn clean(image: DynamicImage, delay: Duration) -> DynamicImage {
    simulate_work(delay);
    image
}

/// A random score in [0, 1). Not derived from the images.
pub fn match_score(delay: Duration) -> f32 {
    simulate_work(delay);
    rand::rng().random::<f32>()
}
