//! Command line arguments for operators embedding the operations engine.
//!
//! ```no_run
//! use clap::Parser;
//! use stackable_operations::cli;
//!
//! #[derive(clap::Parser)]
//! #[command(name = "Foobar Operator", author, version)]
//! struct Opts {
//!     #[clap(subcommand)]
//!     command: cli::Command,
//! }
//!
//! # fn main() -> Result<(), cli::Error> {
//! match Opts::parse().command {
//!     cli::Command::Crd => cli::print_crds()?,
//!     cli::Command::Run(cli::RunArguments { watch_namespace }) => {
//!         // Run the controller
//!     }
//! }
//! # Ok(())
//! # }
//! ```

use std::io::Write as _;

use clap::{Args, Parser};
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::{Api, Client, CustomResourceExt as _, Resource, core::NamespaceResourceScope};
use snafu::{ResultExt as _, Snafu};

use crate::crd::{cluster::Cluster, ops_definition::OpsDefinition, ops_request::OpsRequest};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to serialize CRD {name:?} as YAML"))]
    SerializeCrd {
        source: serde_yaml::Error,
        name: String,
    },

    #[snafu(display("failed to write CRDs to stdout"))]
    WriteStdout { source: std::io::Error },
}

/// A common set of commands used by operators.
///
/// This enum is generic over the arguments available to the [`Command::Run`] subcommand. By
/// default, [`RunArguments`] is used, but a custom type can be used.
#[derive(Debug, PartialEq, Eq, Parser)]
pub enum Command<Run: Args = RunArguments> {
    /// Print CRD objects.
    Crd,

    /// Run the operator.
    Run(Run),
}

/// Default CLI arguments for running the operations controller.
#[derive(Debug, PartialEq, Eq, Parser)]
#[command(long_about = "")]
pub struct RunArguments {
    /// Provides a specific namespace to watch (instead of watching all namespaces)
    #[arg(long, env, default_value = "")]
    pub watch_namespace: WatchNamespace,
}

/// The namespace(s) the controller watches.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WatchNamespace {
    All,
    One(String),
}

impl From<&str> for WatchNamespace {
    fn from(s: &str) -> Self {
        if s.is_empty() {
            Self::All
        } else {
            Self::One(s.to_owned())
        }
    }
}

impl WatchNamespace {
    /// Gets an API object for the namespace in question or for all namespaces,
    /// depending on which variant we are.
    pub fn get_api<K>(&self, client: &Client) -> Api<K>
    where
        K: Resource<DynamicType = (), Scope = NamespaceResourceScope>,
    {
        match self {
            Self::All => Api::all(client.clone()),
            Self::One(namespace) => Api::namespaced(client.clone(), namespace),
        }
    }
}

/// The CRDs owned by the operations engine.
pub fn crds() -> Vec<CustomResourceDefinition> {
    vec![OpsRequest::crd(), OpsDefinition::crd(), Cluster::crd()]
}

/// Prints all [`crds`] to stdout as a multi document YAML stream.
pub fn print_crds() -> Result<(), Error> {
    let mut stdout = std::io::stdout().lock();
    for crd in crds() {
        let yaml = serde_yaml::to_string(&crd).with_context(|_| SerializeCrdSnafu {
            name: crd.metadata.name.clone().unwrap_or_default(),
        })?;
        writeln!(stdout, "---\n{}", yaml.trim_end()).context(WriteStdoutSnafu)?;
    }
    Ok(())
}
