//! Descriptor registry: dynamically loaded protobuf service definitions.
//!
//! Proto files are compiled in-process with `protox` against a configured
//! include path; precompiled binary descriptor sets are accepted as well.
//! The registry answers two queries: parsing a fully-qualified
//! `"pkg.sub.Service/Method"` name, and resolving it to a [`MethodSpec`]
//! carrying the request path, message descriptors, and streaming direction.

use crate::error::{Error, Result};
use prost_reflect::{DescriptorPool, MessageDescriptor};
use std::path::{Path, PathBuf};

/// A parsed fully-qualified method name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FqMethod {
    /// Dotted package path, possibly empty.
    pub package: String,
    /// Bare service name.
    pub service: String,
    /// Method name.
    pub method: String,
}

impl FqMethod {
    /// The service's fully-qualified name, `pkg.sub.Service`.
    pub fn service_full_name(&self) -> String {
        if self.package.is_empty() {
            self.service.clone()
        } else {
            format!("{}.{}", self.package, self.service)
        }
    }
}

/// Split `"pkg.sub.Service/Method"` into its parts.
///
/// Anything without exactly one `/` separating two non-empty halves is
/// rejected as `INVALID_ARGUMENT`.
pub fn parse_fq_method(input: &str) -> Result<FqMethod> {
    match input.split_once('/') {
        Some((service_fqn, method))
            if !service_fqn.is_empty() && !method.is_empty() && !method.contains('/') =>
        {
            let (package, service) = match service_fqn.rsplit_once('.') {
                Some((package, service)) => (package.to_string(), service.to_string()),
                None => (String::new(), service_fqn.to_string()),
            };
            Ok(FqMethod {
                package,
                service,
                method: method.to_string(),
            })
        }
        _ => Err(Error::InvalidMethod(format!(
            "expected \"package.Service/Method\", got \"{input}\""
        ))),
    }
}

/// Everything the call manager needs to invoke one method dynamically.
#[derive(Debug, Clone)]
pub struct MethodSpec {
    /// Fully-qualified service name, `pkg.sub.Service`.
    pub service_fqn: String,
    /// Bare method name.
    pub method_name: String,
    /// gRPC request path, `/pkg.sub.Service/Method`.
    pub path: String,
    /// Request message descriptor.
    pub input: MessageDescriptor,
    /// Response message descriptor.
    pub output: MessageDescriptor,
    /// Whether the client side streams.
    pub client_streaming: bool,
    /// Whether the server side streams.
    pub server_streaming: bool,
}

/// Registry of loaded protobuf descriptors, shared across connections.
///
/// Immutable after startup; resolution is lock-free.
#[derive(Debug, Default, Clone)]
pub struct DescriptorRegistry {
    pool: DescriptorPool,
}

impl DescriptorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Compile the given proto files and add them to the registry.
    ///
    /// The effective search path is the user-supplied include dirs, the
    /// parent directory of every proto file, and the process working
    /// directory, in that order, de-duplicated preserving first occurrence.
    pub fn load_protos(&mut self, protos: &[PathBuf], includes: &[PathBuf]) -> Result<()> {
        if protos.is_empty() {
            return Ok(());
        }
        let search_path = effective_include_path(protos, includes);
        let file_set = protox::compile(protos, &search_path)
            .map_err(|e| Error::DescriptorLoad(e.to_string()))?;
        self.pool
            .add_file_descriptor_set(file_set)
            .map_err(|e| Error::DescriptorLoad(e.to_string()))?;
        Ok(())
    }

    /// Add a precompiled binary `FileDescriptorSet`.
    pub fn add_descriptor_set_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        self.pool
            .decode_file_descriptor_set(bytes)
            .map_err(|e| Error::DescriptorLoad(e.to_string()))?;
        Ok(())
    }

    /// Whether any services have been loaded.
    pub fn is_empty(&self) -> bool {
        self.pool.services().next().is_none()
    }

    /// Resolve `"pkg.sub.Service/Method"` to a [`MethodSpec`].
    ///
    /// A missing package, service, or method each yield a distinct
    /// `NOT_FOUND`-class error naming the missing element.
    pub fn method_spec(&self, fq_method: &str) -> Result<MethodSpec> {
        let parsed = parse_fq_method(fq_method)?;
        let service_fqn = parsed.service_full_name();

        let Some(service) = self.pool.get_service_by_name(&service_fqn) else {
            if !parsed.package.is_empty() && !self.package_exists(&parsed.package) {
                return Err(Error::MethodNotFound(format!(
                    "package \"{}\" not found",
                    parsed.package
                )));
            }
            return Err(Error::MethodNotFound(format!(
                "service \"{service_fqn}\" not found"
            )));
        };

        let Some(method) = service.methods().find(|m| m.name() == parsed.method) else {
            return Err(Error::MethodNotFound(format!(
                "method \"{}\" not found on service \"{service_fqn}\"",
                parsed.method
            )));
        };

        Ok(MethodSpec {
            path: format!("/{service_fqn}/{}", method.name()),
            service_fqn,
            method_name: method.name().to_string(),
            input: method.input(),
            output: method.output(),
            client_streaming: method.is_client_streaming(),
            server_streaming: method.is_server_streaming(),
        })
    }

    fn package_exists(&self, package: &str) -> bool {
        let prefix = format!("{package}.");
        self.pool
            .files()
            .any(|f| f.package_name() == package || f.package_name().starts_with(&prefix))
    }
}

impl From<DescriptorPool> for DescriptorRegistry {
    fn from(pool: DescriptorPool) -> Self {
        Self { pool }
    }
}

/// Union of include dirs, proto parent dirs, and the working directory,
/// first occurrence wins.
fn effective_include_path(protos: &[PathBuf], includes: &[PathBuf]) -> Vec<PathBuf> {
    let mut search_path: Vec<PathBuf> = Vec::new();
    let mut push = |dir: PathBuf| {
        if !search_path.contains(&dir) {
            search_path.push(dir);
        }
    };

    for dir in includes {
        push(dir.clone());
    }
    for proto in protos {
        let parent = match proto.parent() {
            Some(p) if p != Path::new("") => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        push(parent);
    }
    push(PathBuf::from("."));
    search_path
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::test_registry;

    #[test]
    fn test_parse_fq_method() {
        let parsed = parse_fq_method("demo.Greeter/SayHello").unwrap();
        assert_eq!(parsed.package, "demo");
        assert_eq!(parsed.service, "Greeter");
        assert_eq!(parsed.method, "SayHello");
        assert_eq!(parsed.service_full_name(), "demo.Greeter");
    }

    #[test]
    fn test_parse_fq_method_nested_package() {
        let parsed = parse_fq_method("pkg.sub.Service/Method").unwrap();
        assert_eq!(parsed.package, "pkg.sub");
        assert_eq!(parsed.service, "Service");
    }

    #[test]
    fn test_parse_fq_method_no_package() {
        let parsed = parse_fq_method("Greeter/SayHello").unwrap();
        assert_eq!(parsed.package, "");
        assert_eq!(parsed.service_full_name(), "Greeter");
    }

    #[test]
    fn test_parse_fq_method_rejects_bad_input() {
        for input in ["demo.Greeter", "demo.Greeter/Say/Hello", "/Method", "demo.Greeter/", ""] {
            let err = parse_fq_method(input).unwrap_err();
            assert!(
                matches!(err, Error::InvalidMethod(_)),
                "expected InvalidMethod for {input:?}"
            );
        }
    }

    #[test]
    fn test_method_spec_unary() {
        let registry = test_registry();
        let spec = registry.method_spec("demo.Greeter/SayHello").unwrap();
        assert_eq!(spec.path, "/demo.Greeter/SayHello");
        assert_eq!(spec.service_fqn, "demo.Greeter");
        assert_eq!(spec.input.full_name(), "demo.HelloRequest");
        assert_eq!(spec.output.full_name(), "demo.HelloReply");
        assert!(!spec.client_streaming);
        assert!(!spec.server_streaming);
    }

    #[test]
    fn test_method_spec_streaming_flags() {
        let registry = test_registry();

        let spec = registry.method_spec("demo.Greeter/GreetMany").unwrap();
        assert!(!spec.client_streaming);
        assert!(spec.server_streaming);

        let spec = registry
            .method_spec("demo.Greeter/AccumulateGreetings")
            .unwrap();
        assert!(spec.client_streaming);
        assert!(!spec.server_streaming);

        let spec = registry.method_spec("demo.Greeter/Chat").unwrap();
        assert!(spec.client_streaming);
        assert!(spec.server_streaming);
    }

    #[test]
    fn test_method_spec_unknown_package() {
        let registry = test_registry();
        let err = registry.method_spec("nope.Missing/Method").unwrap_err();
        assert!(matches!(err, Error::MethodNotFound(_)));
        assert!(err.to_string().contains("package \"nope\""));
    }

    #[test]
    fn test_method_spec_unknown_service() {
        let registry = test_registry();
        let err = registry.method_spec("demo.Nope/Missing").unwrap_err();
        assert!(matches!(err, Error::MethodNotFound(_)));
        assert!(err.to_string().contains("service \"demo.Nope\""));
    }

    #[test]
    fn test_method_spec_unknown_method() {
        let registry = test_registry();
        let err = registry.method_spec("demo.Greeter/Missing").unwrap_err();
        assert!(matches!(err, Error::MethodNotFound(_)));
        assert!(err.to_string().contains("method \"Missing\""));
        assert!(err.to_string().contains("demo.Greeter"));
    }

    #[test]
    fn test_effective_include_path_order_and_dedup() {
        let protos = vec![
            PathBuf::from("/a/b/one.proto"),
            PathBuf::from("/a/b/two.proto"),
            PathBuf::from("three.proto"),
        ];
        let includes = vec![PathBuf::from("/inc"), PathBuf::from("/a/b")];
        let search = effective_include_path(&protos, &includes);
        assert_eq!(
            search,
            vec![
                PathBuf::from("/inc"),
                PathBuf::from("/a/b"),
                PathBuf::from("."),
            ]
        );
    }

    #[test]
    fn test_empty_registry() {
        let registry = DescriptorRegistry::new();
        assert!(registry.is_empty());
        assert!(!test_registry().is_empty());
    }
}
