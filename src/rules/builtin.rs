//! Built-in processing rules embedded in the crate.
//!
//! Custom rules loaded at startup merge on top of these, source by source.

pub const BUILT_IN_RULES: &[(&str, &str)] = &[
    ("cloudtrail.yaml", include_str!("builtin/cloudtrail.yaml")),
    ("alb.yaml", include_str!("builtin/alb.yaml")),
    ("nlb.yaml", include_str!("builtin/nlb.yaml")),
    ("classic_elb.yaml", include_str!("builtin/classic_elb.yaml")),
    ("s3.yaml", include_str!("builtin/s3.yaml")),
    ("cloudfront.yaml", include_str!("builtin/cloudfront.yaml")),
    ("generic.yaml", include_str!("builtin/generic.yaml")),
    ("cwl_to_fh.yaml", include_str!("builtin/cwl_to_fh.yaml")),
];
