//! # Mezclar: Mixup Augmentation Engine
//!
//! Mezclar combines pairs of training images and their labels before they
//! reach a classifier. One dispatch contract covers simple interpolation
//! (Mixup), box and Fourier masks (CutMix, FMix, ResizeMix, SaliencyMix),
//! saliency-guided graph-cut masks (PuzzleMix) and masks proposed by a small
//! network trained alongside the classifier (AutoMix, SAMix).
//!
//! ## Architecture
//!
//! - **mask**: Per-policy mask and ratio generators
//! - **policy**: Policy registry, selection schedules and the dispatcher
//! - **mixer**: Applies masks to images and labels, attention relabeling
//! - **mixblock**: Learned mask generator with its own optimizer
//! - **metadata**: Per-dispatch record consumed by the loss side
//! - **session**: One training step in the required order
//! - **loss**: Lifting per-sample losses to mixed targets
//! - **autograd** / **optim**: Tape-based autograd and optimizers for the mix block
//! - **config**: Declarative YAML configuration
//!
//! ## Example
//!
//! ```
//! use mezclar::config::{build_dispatcher, from_yaml_str};
//! use mezclar::{ImageBatch, Labels};
//! use ndarray::Array4;
//!
//! let spec = from_yaml_str("seed: 42\npolicies:\n  mixup:\n    alpha: 1.0\n")?;
//! let mut dispatcher = build_dispatcher(&spec)?;
//!
//! let images = Array4::from_shape_fn((4, 3, 8, 8), |(i, _, _, _)| i as f32);
//! let batch = ImageBatch::new(images, Labels::indices(vec![0, 1, 2, 3], 4)?)?;
//! let mixed = dispatcher.next(&batch)?;
//! assert_eq!(mixed.images.dim(), (4, 3, 8, 8));
//! # Ok::<(), mezclar::Error>(())
//! ```

pub mod autograd;
pub mod batch;
pub mod config;
pub mod loss;
pub mod mask;
pub mod metadata;
pub mod mixblock;
pub mod mixer;
pub mod optim;
pub mod policy;
pub mod session;

pub mod error;

// Re-export commonly used types
pub use autograd::Tensor;
pub use batch::{ImageBatch, Labels};
pub use error::{Error, Result};
pub use mask::{MixMask, PartnerTransform};
pub use metadata::MixMetadata;
pub use mixblock::{MixBlock, MixBlockConfig};
pub use mixer::{LabelMode, MixOutput, MixedLabels};
pub use policy::{MixDispatcher, MixPolicy, PolicyId};
pub use session::{MixClassifier, MixSession};
