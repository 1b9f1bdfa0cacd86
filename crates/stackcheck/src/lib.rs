//! # stackcheck - template compliance and drift detection
//!
//! For CLI usage see `stackcheck --help`.
//!
//! ## Introduction for developers
//!
//! Read this to understand how `stackcheck` works internally.
//!
//! ### Terms
//!
//! - a `template` declares `resources`, each with a unique logical id, a type and `properties`
//! - property values are literals or `intrinsic` expressions (`Ref`, `Fn::GetAtt`, `Fn::Sub`, ...)
//! - `parameters`, `mappings` and `conditions` feed those expressions
//! - `outputs` expose values of the deployed stack; a `Ref`/`GetAtt` output binds a logical id to
//!   a physical resource
//!
//! This is a valid template:
//! ```yaml
//! Parameters:
//!   Env:
//!     Type: String
//!     Default: qa17
//! Resources:
//!   Data:
//!     Type: AWS::S3::Bucket
//!     DeletionPolicy: Delete
//!     Properties:
//!       BucketName: !Sub "${Env}-data"
//! Outputs:
//!   DataBucket:
//!     Value: !Ref Data
//! ```
//!
//! ### Loading
//!
//! see [template::Template::parse]
//!
//! JSON, YAML (with the `!Ref` style short forms) and an HCL dialect are accepted. All three are
//! lowered to the same raw document and then parsed into [template::Template]: resources are
//! stored in an arena and addressed by [template::NodeIndex]; every property is parsed into an
//! [expression::Property] tree. Duplicate logical ids are rejected here, before any map can
//! silently drop one.
//!
//! ### Resolving
//!
//! see [resolver]
//!
//! Every property is evaluated without live values. The result is a [resolver::Resolved]:
//!
//! | **declared**                      | **resolved**                         |
//! |-----------------------------------|--------------------------------------|
//! | `qa17-data`                       | `Literal("qa17-data")`               |
//! | `!Sub "${Env}-data"`              | `Literal("qa17-data")`               |
//! | `!Sub "${AWS::AccountId}-data"`   | `Symbolic(${?}-data)`                |
//! | `!FindInMap [M, !Ref Key, x]`     | `Unresolvable` (key only known later)|
//!
//! _Note: `Ref` to a resource resolves through the rule catalog (a bucket's `Ref` is its name)._
//!
//! Resolution runs on an explicit work stack instead of recursing, memoizes finished nodes and
//! reports cycles with their full path.
//!
//! ### Dependency graph
//!
//! see [graph::DependencyGraph]
//!
//! Edges come from references (implicit) and `DependsOn` (explicit hints). A hint already implied
//! by a reference is recorded as redundant. The graph must be acyclic.
//!
//! ### Rules
//!
//! see [rules::RuleEngine]
//!
//! Each [rules::Rule] looks at one resource at a time and reports [rules::Violation]s plus
//! [rules::Assertion]s (fields it placed a requirement on). What counts as stateful, encrypted or
//! public is configured in [config::RuleConfig], not coded into the rules.
//!
//! ### Live state and drift
//!
//! see [live::LiveStateCollector] and [drift::compare]
//!
//! Asserted fields are compared with what a [live::ProviderClient] reports for the deployed
//! environment. Symbolic expectations that cannot be reduced are reported as not observable.
//!
//! ### Output
//!
//! [pipeline::Pipeline] runs the stages in order and produces a [report::Report] which in turn
//! gets serialized via [serde].
//!
pub mod config;
pub mod context;
pub mod drift;
pub mod error;
pub mod expression;
pub mod graph;
mod hcl_template;
pub mod live;
pub mod pipeline;
pub mod report;
pub mod resolver;
pub mod rules;
pub mod template;
pub mod util;
pub mod value;
mod visit;
