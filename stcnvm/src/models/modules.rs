mod blocks;
mod deform_conv;
mod focal;
mod frame_align;
mod fusion;
mod gru;
mod matching;
mod patch_attention;
mod pooling;
mod refine;
mod soft_attention;

pub use blocks::*;
pub use deform_conv::*;
pub use focal::*;
pub use frame_align::*;
pub use fusion::*;
pub use gru::*;
pub use matching::*;
pub use patch_attention::*;
pub use pooling::*;
pub use refine::*;
pub use soft_attention::*;
