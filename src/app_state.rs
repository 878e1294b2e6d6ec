use crate::groups::Groups;
use crate::handler::RelayInfoDocument;
use std::sync::Arc;

#[derive(Debug)]
pub struct HttpServerState {
    pub groups: Arc<Groups>,
    pub relay_info: RelayInfoDocument,
}

impl HttpServerState {
    pub fn new(groups: Arc<Groups>, relay_info: RelayInfoDocument) -> Self {
        Self { groups, relay_info }
    }
}
