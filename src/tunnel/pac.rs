use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use super::crypto::target_matched;
use super::{Dialer, ProxyStream, TargetAddr, TunnelError};
use crate::access::AccessList;

/// Proxy-auto-config dialer: targets on the access list go through the
/// tunnel dialer, everything else connects directly.
pub struct PacDialer {
    tunnel: Arc<dyn Dialer>,
    direct: Arc<dyn Dialer>,
    access_list: Arc<AccessList>,
}

impl PacDialer {
    pub fn new(tunnel: Arc<dyn Dialer>, direct: Arc<dyn Dialer>, access_list: Arc<AccessList>) -> Self {
        Self {
            tunnel,
            direct,
            access_list,
        }
    }
}

#[async_trait]
impl Dialer for PacDialer {
    async fn dial(&self, target: &TargetAddr) -> Result<ProxyStream, TunnelError> {
        if target_matched(&self.access_list, target) {
            debug!("{} matched, tunneling", target);
            self.tunnel.dial(target).await
        } else {
            self.direct.dial(target).await
        }
    }
}
