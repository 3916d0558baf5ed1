use crate::hub::Hub;

#[derive(Clone)]
pub(crate) struct AppState {
    hub: Hub,
}

impl AppState {
    pub fn new(hub: Hub) -> Self {
        Self { hub }
    }

    pub fn hub(&self) -> &Hub {
        &self.hub
    }
}
