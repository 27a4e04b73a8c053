pub mod common;
pub mod markup;

pub use common::MessageUtils;
pub use markup::{DefaultMarkupRewriter, MarkupRewriter, RewriteContext, TextFormat};
