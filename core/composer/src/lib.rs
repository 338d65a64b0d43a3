pub mod composer;
pub mod templates;

pub use composer::{
    AnswerComposer, AnswerModel, AnswerModelConfig, AnswerProvider, LlmAnswerModel,
};
pub use templates::CitationRenderer;
