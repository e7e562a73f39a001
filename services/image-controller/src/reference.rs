//! Image reference normalization.
//!
//! Short Docker Hub names are expanded to fully qualified references before
//! they reach the runtime, which does not apply a default registry itself.
//!
//! Examples:
//! - `nginx` -> `docker.io/library/nginx`
//! - `nginx:1.27` -> `docker.io/library/nginx:1.27`
//! - `bitnami/redis` -> `docker.io/bitnami/redis`
//! - `ghcr.io/org/repo:v1` -> unchanged
//! - `localhost:5000/app` -> unchanged

/// Registry used for references without an explicit registry host.
pub const DEFAULT_REGISTRY: &str = "docker.io";

/// Namespace of official images on the default registry.
pub const DEFAULT_NAMESPACE: &str = "library";

/// Expand `image` to a fully qualified reference.
pub fn normalize_image_ref(image: &str) -> String {
    let image = image.trim();

    match image.split_once('/') {
        None => format!("{}/{}/{}", DEFAULT_REGISTRY, DEFAULT_NAMESPACE, image),
        Some((first, _)) if is_registry_host(first) => image.to_string(),
        Some(_) => format!("{}/{}", DEFAULT_REGISTRY, image),
    }
}

/// Whether the first path component of a reference names a registry.
fn is_registry_host(component: &str) -> bool {
    component.contains('.') || component.contains(':') || component == "localhost"
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("nginx", "docker.io/library/nginx")]
    #[case("nginx:1.27", "docker.io/library/nginx:1.27")]
    #[case("nginx@sha256:abc", "docker.io/library/nginx@sha256:abc")]
    #[case("bitnami/redis", "docker.io/bitnami/redis")]
    #[case("bitnami/redis:7", "docker.io/bitnami/redis:7")]
    #[case("  nginx  ", "docker.io/library/nginx")]
    fn test_short_names_are_expanded(#[case] input: &str, #[case] expected: &str) {
        assert_eq!(normalize_image_ref(input), expected);
    }

    #[rstest]
    #[case("myregistry.example.com/nginx")]
    #[case("docker.io/library/nginx")]
    #[case("docker.io/bitnami/redis:7")]
    #[case("ghcr.io/org/repo:v1")]
    #[case("localhost/app")]
    #[case("localhost:5000/app:dev")]
    #[case("registry.example.com/team/sub/app@sha256:abc")]
    fn test_qualified_names_are_unchanged(#[case] input: &str) {
        assert_eq!(normalize_image_ref(input), input);
    }
}
