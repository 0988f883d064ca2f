pub mod bce;
pub mod pit;
pub mod sisnr;

pub use bce::BceLoss;
pub use pit::{mixture_si_snr, permutations, pit_loss, pit_loss_grad, PitOutput};
pub use sisnr::{sdr, si_snr, si_snr_grad};
