pub mod parser;
pub mod types;

pub use parser::{
    finalize, parse_manifest_from_file, parse_thin_manifests_from_dir, ValidationError,
};
pub use types::{Digest, DigestError, Image, Manifest, RegistryContext, RenameRule, Tag, TagError};

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_yaml() -> &'static str {
        r#"
registries:
  - name: staging.example.io/project
    src: true
  - name: prod.example.io/project
    service-account: promoter@example.iam.gserviceaccount.com
images:
  - name: foo/bar
    dmap:
      sha256:0000000000000000000000000000000000000000000000000000000000aa: [v1, v1.0]
      sha256:0000000000000000000000000000000000000000000000000000000000bb: []
"#
    }

    #[test]
    fn parses_and_finalizes() {
        let mut m: Manifest = serde_yaml::from_str(sample_yaml()).unwrap();
        finalize(&mut m).unwrap();
        assert_eq!(m.src_registry.as_ref().unwrap().name, "staging.example.io/project");
        assert_eq!(m.images.len(), 1);
        assert_eq!(m.images[0].dmap.len(), 2);
    }

    #[test]
    fn rejects_two_src_registries() {
        let yaml = r#"
registries:
  - name: a
    src: true
  - name: b
    src: true
images: []
"#;
        let mut m: Manifest = serde_yaml::from_str(yaml).unwrap();
        assert!(finalize(&mut m).is_err());
    }

    #[test]
    fn rejects_zero_src_registries() {
        let yaml = r#"
registries:
  - name: a
  - name: b
images: []
"#;
        let mut m: Manifest = serde_yaml::from_str(yaml).unwrap();
        assert!(finalize(&mut m).is_err());
    }

    #[test]
    fn empty_images_is_not_a_failure() {
        let yaml = r#"
registries:
  - name: a
    src: true
  - name: b
images: []
"#;
        let mut m: Manifest = serde_yaml::from_str(yaml).unwrap();
        assert!(finalize(&mut m).is_ok());
        assert!(m.images.is_empty());
    }

    #[test]
    fn digest_case_is_rejected() {
        let yaml = r#"
registries:
  - {name: a, src: true}
images:
  - name: x
    dmap:
      "sha256:AAAA000000000000000000000000000000000000000000000000000000aa": []
"#;
        let res: Result<Manifest, _> = serde_yaml::from_str(yaml);
        assert!(res.is_err());
    }

    #[test]
    fn tag_length_boundary() {
        let ok = "a".repeat(128);
        assert!(Tag::parse(ok).is_ok());
        let too_long = "a".repeat(129);
        assert!(Tag::parse(too_long).is_err());
    }

    #[test]
    fn unknown_field_is_hard_failure() {
        let yaml = r#"
registries:
  - {name: a, src: true}
images: []
bogus_key: true
"#;
        let res: Result<Manifest, _> = serde_yaml::from_str(yaml);
        assert!(res.is_err());
    }
}
