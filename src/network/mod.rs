pub mod params;
pub mod tasnet;
pub mod domain_cls;
pub mod critic;

pub use params::{clip_grad_norm, Gradients, Module, StateDict};
pub use tasnet::{Domain, NormType, TasNet, TasNetConfig, TasNetPass};
pub use domain_cls::DomainClassifier;
pub use critic::{CriticConfig, MultiScaleCritic};
