//! Synthetic binary classification datasets in the plane
//!
//! Every generator takes the RNG explicitly so a seed reproduces the same points. Labels
//! are class indices, 0 or 1.

use std::{
    f32::consts::PI,
    fmt::{self, Display},
};

use clap::ValueEnum;
use rand::Rng;

/// Number of input features for every dataset in this module
pub const N_FEATURES: usize = 2;
/// Number of classes for every dataset in this module
pub const N_CLASSES: usize = 2;

/// Toggles between dataset types
#[derive(Debug, ValueEnum, Clone, Copy, PartialEq, Eq)]
pub enum Dataset {
    Line,
    Circle,
    Xor,
    Moon,
}

impl Display for Dataset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Dataset::Line => write!(f, "line"),
            Dataset::Circle => write!(f, "circle"),
            Dataset::Xor => write!(f, "xor"),
            Dataset::Moon => write!(f, "moon"),
        }
    }
}

/// Points and their class labels
pub type Samples = (Vec<Vec<f32>>, Vec<usize>);

/// Loads a dataset based on the dataset type
pub fn load_dataset(dataset: Dataset, class_size: usize, rng: &mut impl Rng) -> Samples {
    let samples = match dataset {
        Dataset::Line => gen_linear_data(class_size, rng),
        Dataset::Circle => gen_circle_data(class_size, rng),
        Dataset::Xor => gen_xor_data(class_size, rng),
        Dataset::Moon => gen_moon_data(class_size, rng),
    };
    log::debug!("generated {} samples of {}", samples.0.len(), dataset);
    samples
}

/// Points on either side of the line `y = x`
pub fn gen_linear_data(class_size: usize, rng: &mut impl Rng) -> Samples {
    let mut data = Vec::new();
    let mut labels = Vec::new();

    for _ in 0..class_size {
        let x = rng.random_range(-5.0..5.0);
        let y = rng.random_range(-5.0..5.0);
        data.push(vec![x, y]);
        labels.push(if x > y { 0 } else { 1 });
    }

    (data, labels)
}

/// Two noisy concentric rings, the inner ring is class 0
pub fn gen_circle_data(class_size: usize, rng: &mut impl Rng) -> Samples {
    let mut data = Vec::new();
    let mut labels = Vec::new();

    for (label, radius) in [(0, 3.0f32), (1, 5.0f32)] {
        for _ in 0..class_size {
            let angle = rng.random_range(0.0..2.0 * PI);
            let r = radius * (1.0 + rng.random_range(-0.25..0.25));
            data.push(vec![r * angle.cos(), r * angle.sin()]);
            labels.push(label);
        }
    }

    (data, labels)
}

/// Points labeled by the sign of `x * y`
pub fn gen_xor_data(class_size: usize, rng: &mut impl Rng) -> Samples {
    let mut data = Vec::new();
    let mut labels = Vec::new();

    for _ in 0..class_size {
        let x = rng.random_range(-5.0..5.0);
        let y = rng.random_range(-5.0..5.0);
        data.push(vec![x, y]);
        labels.push(if x * y > 0.0 { 0 } else { 1 });
    }

    (data, labels)
}

/// Two interleaving half circles
pub fn gen_moon_data(class_size: usize, rng: &mut impl Rng) -> Samples {
    let mut data = Vec::new();
    let mut labels = Vec::new();
    let radius = 3.0;

    for label in [0, 1] {
        for _ in 0..class_size {
            let theta = rng.random_range(-PI / 4.0..PI * 5.0 / 4.0);
            let (x, y) = if label == 0 {
                (radius * theta.cos(), radius * theta.sin())
            } else {
                (radius * theta.cos() + 2.0, -radius * theta.sin() - 0.2)
            };
            let noise_x = rng.random_range(-0.1..0.1);
            let noise_y = rng.random_range(-0.1..0.1);
            data.push(vec![x + noise_x, y + noise_y]);
            labels.push(label);
        }
    }

    (data, labels)
}
