//! Git-facing pieces of the gateway: command classification, repository name
//! sanitisation, the containment guard, pkt-line error framing, bare
//! repository helpers and the executor that shells out to `git`.

pub mod bare_repo;
pub mod executor;
pub mod guard;
pub mod pktline;
pub mod sanitize;
pub mod service;

pub use bare_repo::{discover_repos, init_bare_repo};
pub use executor::{Executor, GitExecutor, SessionStreams};
pub use sanitize::RepoName;
pub use service::{GitCommand, Invocation};
