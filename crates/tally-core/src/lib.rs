pub mod capture;
pub mod codec;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod event;
pub mod flush;
pub mod io;
pub mod ledger;
pub mod paths;
pub mod pipeline;
pub mod queue;
pub mod reconcile;
pub mod schedule;
pub mod score;
pub mod types;

pub use capture::{ActionSpec, Anonymous, Capture, CaptureSubject, IdentitySource, RequestContext};
pub use config::Config;
pub use error::{Result, TallyError};
pub use event::{ActivityEvent, Origin};
pub use flush::FlushReport;
pub use pipeline::Pipeline;
pub use reconcile::ReconcileReport;
pub use score::{ScoreCounter, ScoreKey};
pub use types::{EventStatus, Priority};
