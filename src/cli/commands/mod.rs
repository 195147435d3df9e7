mod accel;
mod blob;
mod bundle;
mod new;
mod run;
mod util;

pub(crate) use accel::cmd_accel;
pub(crate) use blob::{cmd_hash, cmd_list, cmd_put_bits, cmd_show};
pub(crate) use bundle::{cmd_export, cmd_import};
pub(crate) use new::cmd_new;
pub(crate) use run::cmd_run;

pub(crate) use util::{load_options, require_store_path};
