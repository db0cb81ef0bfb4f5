mod conntrack;
mod nft;

pub use nft::reconcile;
