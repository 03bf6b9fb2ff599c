#[cfg(test)]
mod unit_tests {
    use super::super::*;

    #[test]
    fn test_load_transform_encode_roundtrip_through_legacy_codepage() {
        let resolver = EncodingResolver::new(Encoding::Windows1252);
        let decoded = resolver.load(b"na\xEFve  \nline", None).unwrap();
        assert_eq!(decoded.encoding, Encoding::Windows1252);
        assert!(!decoded.confident);
        assert_eq!(decoded.text, "naïve  \nline");

        let transforms = SaveTransforms {
            remove_trailing_spaces: true,
            append_empty_line: true,
        };
        let cleaned = transforms.apply(&decoded.text);
        let bytes = resolver
            .encode_for_save(&cleaned, decoded.encoding)
            .unwrap();
        assert_eq!(bytes, b"na\xEFve\nline\n".to_vec());
    }

    #[test]
    fn test_replace_can_make_content_unrepresentable() {
        let resolver = EncodingResolver::default();
        let pattern = SearchPattern::literal("EUR").unwrap();
        let replaced = pattern.replace_all("price: 5 EUR", "€");
        assert_eq!(replaced.count, 1);

        assert!(resolver
            .validate_for_save(&replaced.text, Encoding::Windows1252)
            .is_ok());
        let err = resolver
            .validate_for_save(&replaced.text, Encoding::Iso8859_1)
            .unwrap_err();
        assert!(err.to_string().contains("ISO-8859-1"));
    }

    #[test]
    fn test_every_encoding_round_trips_ascii() {
        let resolver = EncodingResolver::default();
        for encoding in Encoding::ALL {
            let bytes = resolver.encode_for_save("plain ascii", encoding).unwrap();
            let (text, lossy) = encoding::decode(&bytes, encoding);
            assert_eq!(text, "plain ascii", "encoding {encoding}");
            assert!(!lossy, "encoding {encoding}");
        }
    }

    #[test]
    fn test_labels_round_trip() {
        for encoding in Encoding::ALL {
            assert_eq!(Encoding::from_label(encoding.label()), Some(encoding));
        }
    }
}
