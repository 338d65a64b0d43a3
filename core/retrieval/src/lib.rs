pub mod embedding;
pub mod search;

pub use embedding::{
    cosine_similarity, tokenize, Embedder, PseudoEmbedder, RemoteEmbedder, EMBEDDING_DIM,
};
pub use search::SearchEngine;
