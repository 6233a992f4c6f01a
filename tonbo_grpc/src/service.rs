//! Method registration.
//!
//! A [`ServiceDefinition`] collects the methods of one service with their
//! opaque serializer/deserializer callbacks; the [`HandlerRegistry`] maps
//! exact method paths (`/pkg.Service/Method`) to type-erased dispatch
//! functions. Message (de)serialization stays outside the core: the
//! callbacks are the only place user message types appear.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use bytes::Bytes;

use crate::handlers::{
    client_stream_dispatch, duplex_dispatch, server_stream_dispatch, unary_dispatch,
    unimplemented_dispatch, DispatchFn, Reply, RequestStream, ResponseSink, UnaryContext,
};
use crate::status::Status;

pub type SerializeFn<T> = Arc<dyn Fn(&T) -> Result<Bytes, Status> + Send + Sync>;
pub type DeserializeFn<T> = Arc<dyn Fn(Bytes) -> Result<T, Status> + Send + Sync>;

/// The four gRPC call shapes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MethodKind {
    Unary,
    ClientStream,
    ServerStream,
    Duplex,
}

impl MethodKind {
    /// Derives the shape from a method descriptor's streaming flags.
    pub fn from_flags(request_stream: bool, response_stream: bool) -> Self {
        match (request_stream, response_stream) {
            (false, false) => MethodKind::Unary,
            (true, false) => MethodKind::ClientStream,
            (false, true) => MethodKind::ServerStream,
            (true, true) => MethodKind::Duplex,
        }
    }
}

/// One registered method: its shape plus the dispatch function invoked per
/// stream.
#[derive(Clone)]
pub struct MethodHandler {
    pub kind: MethodKind,
    pub(crate) dispatch: DispatchFn,
}

// ============================================================================
// Registry
// ============================================================================

/// Exact-path handler map. Frozen once the server starts.
#[derive(Default)]
pub struct HandlerRegistry {
    methods: HashMap<String, MethodHandler>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a handler under `path`. Returns `false`, leaving the
    /// registry untouched, when the path is already present.
    pub fn register(&mut self, path: impl Into<String>, handler: MethodHandler) -> bool {
        let path = path.into();
        if self.methods.contains_key(&path) {
            return false;
        }
        self.methods.insert(path, handler);
        true
    }

    pub fn lookup(&self, path: &str) -> Option<MethodHandler> {
        self.methods.get(path).cloned()
    }

    pub fn contains(&self, path: &str) -> bool {
        self.methods.contains_key(path)
    }

    pub fn len(&self) -> usize {
        self.methods.len()
    }

    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }
}

// ============================================================================
// Service definition
// ============================================================================

/// The methods of one service, collected before registration.
#[derive(Default)]
pub struct ServiceDefinition {
    methods: Vec<(String, MethodHandler)>,
}

impl ServiceDefinition {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a unary method.
    pub fn unary<Req, Res, De, Ser, F, Fut>(
        mut self,
        path: impl Into<String>,
        deserialize: De,
        serialize: Ser,
        handler: F,
    ) -> Self
    where
        Req: Send + 'static,
        Res: Send + 'static,
        De: Fn(Bytes) -> Result<Req, Status> + Send + Sync + 'static,
        Ser: Fn(&Res) -> Result<Bytes, Status> + Send + Sync + 'static,
        F: Fn(UnaryContext<Req>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Reply<Res>, Status>> + Send + 'static,
    {
        let dispatch = unary_dispatch(Arc::new(deserialize), Arc::new(serialize), handler);
        self.methods.push((
            path.into(),
            MethodHandler {
                kind: MethodKind::Unary,
                dispatch,
            },
        ));
        self
    }

    /// Adds a client-streaming method.
    pub fn client_streaming<Req, Res, De, Ser, F, Fut>(
        mut self,
        path: impl Into<String>,
        deserialize: De,
        serialize: Ser,
        handler: F,
    ) -> Self
    where
        Req: Send + 'static,
        Res: Send + 'static,
        De: Fn(Bytes) -> Result<Req, Status> + Send + Sync + 'static,
        Ser: Fn(&Res) -> Result<Bytes, Status> + Send + Sync + 'static,
        F: Fn(RequestStream<Req>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Reply<Res>, Status>> + Send + 'static,
    {
        let dispatch = client_stream_dispatch(Arc::new(deserialize), Arc::new(serialize), handler);
        self.methods.push((
            path.into(),
            MethodHandler {
                kind: MethodKind::ClientStream,
                dispatch,
            },
        ));
        self
    }

    /// Adds a server-streaming method.
    pub fn server_streaming<Req, Res, De, Ser, F, Fut>(
        mut self,
        path: impl Into<String>,
        deserialize: De,
        serialize: Ser,
        handler: F,
    ) -> Self
    where
        Req: Send + 'static,
        Res: Send + 'static,
        De: Fn(Bytes) -> Result<Req, Status> + Send + Sync + 'static,
        Ser: Fn(&Res) -> Result<Bytes, Status> + Send + Sync + 'static,
        F: Fn(UnaryContext<Req>, ResponseSink<Res>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), Status>> + Send + 'static,
    {
        let dispatch = server_stream_dispatch(Arc::new(deserialize), Arc::new(serialize), handler);
        self.methods.push((
            path.into(),
            MethodHandler {
                kind: MethodKind::ServerStream,
                dispatch,
            },
        ));
        self
    }

    /// Adds a bidirectional-streaming method.
    pub fn duplex<Req, Res, De, Ser, F, Fut>(
        mut self,
        path: impl Into<String>,
        deserialize: De,
        serialize: Ser,
        handler: F,
    ) -> Self
    where
        Req: Send + 'static,
        Res: Send + 'static,
        De: Fn(Bytes) -> Result<Req, Status> + Send + Sync + 'static,
        Ser: Fn(&Res) -> Result<Bytes, Status> + Send + Sync + 'static,
        F: Fn(RequestStream<Req>, ResponseSink<Res>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), Status>> + Send + 'static,
    {
        let dispatch = duplex_dispatch(Arc::new(deserialize), Arc::new(serialize), handler);
        self.methods.push((
            path.into(),
            MethodHandler {
                kind: MethodKind::Duplex,
                dispatch,
            },
        ));
        self
    }

    /// Declares a method the service does not implement. Calls to it are
    /// answered with `UNIMPLEMENTED` naming the path.
    pub fn unimplemented_method(mut self, path: impl Into<String>, kind: MethodKind) -> Self {
        let path = path.into();
        let dispatch = unimplemented_dispatch(path.clone());
        self.methods.push((path, MethodHandler { kind, dispatch }));
        self
    }

    pub(crate) fn into_methods(self) -> Vec<(String, MethodHandler)> {
        self.methods
    }

    /// The registered paths, in registration order.
    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.methods.iter().map(|(path, _)| path.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop_handler() -> MethodHandler {
        MethodHandler {
            kind: MethodKind::Unary,
            dispatch: unimplemented_dispatch("/T/Noop".to_string()),
        }
    }

    #[test]
    fn register_rejects_duplicates_without_mutating() {
        let mut registry = HandlerRegistry::new();
        assert!(registry.register("/Echo/Echo", noop_handler()));
        assert!(!registry.register("/Echo/Echo", noop_handler()));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn lookup_is_exact_match() {
        let mut registry = HandlerRegistry::new();
        registry.register("/Echo/Echo", noop_handler());
        assert!(registry.lookup("/Echo/Echo").is_some());
        assert!(registry.lookup("/Echo/echo").is_none());
        assert!(registry.lookup("/Echo/Echo/").is_none());
    }

    #[test]
    fn kind_derivation_from_flags() {
        assert_eq!(MethodKind::from_flags(false, false), MethodKind::Unary);
        assert_eq!(MethodKind::from_flags(true, false), MethodKind::ClientStream);
        assert_eq!(MethodKind::from_flags(false, true), MethodKind::ServerStream);
        assert_eq!(MethodKind::from_flags(true, true), MethodKind::Duplex);
    }

    #[test]
    fn service_definition_collects_paths_in_order() {
        let svc = ServiceDefinition::new()
            .unimplemented_method("/S/A", MethodKind::Unary)
            .unimplemented_method("/S/B", MethodKind::Duplex);
        let paths: Vec<_> = svc.paths().collect();
        assert_eq!(paths, vec!["/S/A", "/S/B"]);
    }
}
