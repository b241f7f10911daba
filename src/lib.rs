pub mod analysis {
    pub mod block;
    pub mod cache;
    pub mod context;
    pub mod error;
    pub mod explorer;
    pub mod graph;
    pub mod option;
    pub mod reached_set;
    pub mod reducer;
    pub mod shutdown;
    pub mod statistics;
    pub mod subtree_remover;
    pub mod value_domain;
}

pub use analysis::context::GlobalContext;
pub use analysis::error::{BamError, Result};
