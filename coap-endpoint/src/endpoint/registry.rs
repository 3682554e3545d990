// Copyright 2019 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//

use super::server_helper::BlockwiseServerHelper;
use super::RequestHandler;
use crate::message::MsgCode;
use std::sync::Arc;

/// Registration flags for a resource handler: the allowed methods and the
/// filter group the handler belongs to.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct HandlerFlags {
    methods: u8,
    group: u8,
}

impl HandlerFlags {
    const GET: u8 = 1 << 0;
    const POST: u8 = 1 << 1;
    const PUT: u8 = 1 << 2;
    const DELETE: u8 = 1 << 3;

    /// The highest filter group number.
    pub const MAX_GROUP: u8 = 7;

    /// Flags allowing no methods, in group 0.
    pub fn new() -> HandlerFlags {
        HandlerFlags {
            methods: 0,
            group: 0,
        }
    }

    /// Flags allowing every method, in group 0.
    pub fn allow_all() -> HandlerFlags {
        HandlerFlags {
            methods: Self::GET | Self::POST | Self::PUT | Self::DELETE,
            group: 0,
        }
    }

    /// Allows GET requests.
    pub fn allow_get(mut self) -> HandlerFlags {
        self.methods |= Self::GET;
        self
    }

    /// Allows POST requests.
    pub fn allow_post(mut self) -> HandlerFlags {
        self.methods |= Self::POST;
        self
    }

    /// Allows PUT requests.
    pub fn allow_put(mut self) -> HandlerFlags {
        self.methods |= Self::PUT;
        self
    }

    /// Allows DELETE requests.
    pub fn allow_delete(mut self) -> HandlerFlags {
        self.methods |= Self::DELETE;
        self
    }

    /// Places the handler in the given filter group (0 through
    /// [`HandlerFlags::MAX_GROUP`]). Out-of-range groups saturate.
    pub fn group(mut self, group: u8) -> HandlerFlags {
        self.group = group.min(Self::MAX_GROUP);
        self
    }

    /// Returns true when `method` is allowed by these flags.
    pub fn allows(&self, method: MsgCode) -> bool {
        let bit = match method {
            MsgCode::MethodGet => Self::GET,
            MsgCode::MethodPost => Self::POST,
            MsgCode::MethodPut => Self::PUT,
            MsgCode::MethodDelete => Self::DELETE,
            _ => return false,
        };
        self.methods & bit != 0
    }
}

impl Default for HandlerFlags {
    fn default() -> Self {
        HandlerFlags::allow_all()
    }
}

pub(crate) struct HandlerEntry {
    pub path: String,
    pub flags: HandlerFlags,
    pub handler: Arc<dyn RequestHandler>,
    pub helper: Arc<BlockwiseServerHelper>,
}

/// The outcome of routing a request path + method through the registry.
pub(crate) enum RouteResult {
    /// No enabled handler is registered for the path.
    NotFound,

    /// A handler matched the path but does not allow the method.
    MethodNotAllowed,

    /// The request should be dispatched to this handler.
    Matched {
        handler: Arc<dyn RequestHandler>,
        helper: Arc<BlockwiseServerHelper>,
    },
}

/// Path → handler map with filter groups.
///
/// Lookup is by exact match on the `/`-joined URI-PATH segments. Filter
/// groups can be disabled wholesale, hiding their handlers from routing
/// without unregistering them.
#[derive(Default)]
pub(crate) struct Registry {
    handlers: Vec<HandlerEntry>,
    disabled_groups: u8,
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field(
                "paths",
                &self
                    .handlers
                    .iter()
                    .map(|entry| entry.path.as_str())
                    .collect::<Vec<_>>(),
            )
            .field("disabled_groups", &self.disabled_groups)
            .finish()
    }
}

impl Registry {
    pub fn register(&mut self, path: &str, flags: HandlerFlags, handler: Arc<dyn RequestHandler>) {
        let path = normalize(path);
        self.handlers.push(HandlerEntry {
            path,
            flags,
            handler,
            helper: Arc::new(BlockwiseServerHelper::new()),
        });
    }

    /// Removes registrations matching `handler`, restricted to `path` when
    /// one is given. Returns how many were removed.
    pub fn unregister(&mut self, path: Option<&str>, handler: &Arc<dyn RequestHandler>) -> usize {
        let path = path.map(normalize);
        let before = self.handlers.len();
        self.handlers.retain(|entry| {
            let path_matches = match &path {
                Some(p) => &entry.path == p,
                None => true,
            };
            !(path_matches && Arc::ptr_eq(&entry.handler, handler))
        });
        before - self.handlers.len()
    }

    pub fn set_group_enabled(&mut self, group: u8, enabled: bool) {
        let bit = 1u8 << group.min(HandlerFlags::MAX_GROUP);
        if enabled {
            self.disabled_groups &= !bit;
        } else {
            self.disabled_groups |= bit;
        }
    }

    pub fn route(&self, path: &str, method: MsgCode) -> RouteResult {
        let mut saw_path = false;

        for entry in &self.handlers {
            if entry.path != path {
                continue;
            }
            if self.disabled_groups & (1 << entry.flags.group) != 0 {
                continue;
            }
            saw_path = true;
            if entry.flags.allows(method) {
                return RouteResult::Matched {
                    handler: entry.handler.clone(),
                    helper: entry.helper.clone(),
                };
            }
        }

        if saw_path {
            RouteResult::MethodNotAllowed
        } else {
            RouteResult::NotFound
        }
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.len()
    }
}

fn normalize(path: &str) -> String {
    path.trim_matches('/').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::{OutgoingResponse, RequestContext};
    use crate::Error;

    struct NullHandler;

    impl RequestHandler for NullHandler {
        fn on_request(&self, _context: &RequestContext<'_>) -> Result<OutgoingResponse, Error> {
            Ok(OutgoingResponse::content(b"ok".to_vec()))
        }
    }

    fn handler() -> Arc<dyn RequestHandler> {
        Arc::new(NullHandler)
    }

    #[test]
    fn routes_by_exact_path_and_method() {
        let mut registry = Registry::default();
        registry.register("ping", HandlerFlags::new().allow_get(), handler());

        assert!(matches!(
            registry.route("ping", MsgCode::MethodGet),
            RouteResult::Matched { .. }
        ));
        assert!(matches!(
            registry.route("ping", MsgCode::MethodPost),
            RouteResult::MethodNotAllowed
        ));
        assert!(matches!(
            registry.route("pong", MsgCode::MethodGet),
            RouteResult::NotFound
        ));
        assert!(matches!(
            registry.route("ping/sub", MsgCode::MethodGet),
            RouteResult::NotFound
        ));
    }

    #[test]
    fn leading_slash_is_normalized() {
        let mut registry = Registry::default();
        registry.register("/a/b", HandlerFlags::allow_all(), handler());
        assert!(matches!(
            registry.route("a/b", MsgCode::MethodPut),
            RouteResult::Matched { .. }
        ));
    }

    #[test]
    fn disabled_group_hides_handlers() {
        let mut registry = Registry::default();
        registry.register(
            "secret",
            HandlerFlags::new().allow_get().group(3),
            handler(),
        );

        registry.set_group_enabled(3, false);
        assert!(matches!(
            registry.route("secret", MsgCode::MethodGet),
            RouteResult::NotFound
        ));

        registry.set_group_enabled(3, true);
        assert!(matches!(
            registry.route("secret", MsgCode::MethodGet),
            RouteResult::Matched { .. }
        ));
    }

    #[test]
    fn unregister_by_path_and_identity() {
        let mut registry = Registry::default();
        let shared = handler();
        registry.register("x", HandlerFlags::allow_all(), shared.clone());
        registry.register("y", HandlerFlags::allow_all(), shared.clone());
        registry.register("y", HandlerFlags::allow_all(), handler());

        assert_eq!(registry.unregister(Some("x"), &shared), 1);
        assert_eq!(registry.handler_count(), 2);

        // Null path removes the handler wherever it is registered.
        assert_eq!(registry.unregister(None, &shared), 1);
        assert_eq!(registry.handler_count(), 1);
    }
}
