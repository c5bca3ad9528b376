pub mod backend;
pub mod location;
pub mod model_context;
pub mod widget_store;

pub(crate) use backend::HttpBackend;
pub(crate) use location::LocationCache;
pub(crate) use model_context::ModelContextStore;
pub(crate) use widget_store::WidgetStore;
