pub(crate) mod counter_app;

pub(crate) mod evidence;

pub(crate) mod logging;

pub(crate) mod network;

pub(crate) mod node;
