// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

macro_rules! peering_log {
    ($self:expr, $level:ident, $msg:expr; $($key:expr => $value:expr),*) => {
        slog::$level!($self.log,
            $msg;
            "component" => crate::COMPONENT_BGP,
            "module" => crate::MOD_PEERING,
            "unit" => crate::UNIT_CONTROLLER,
            "peer_name" => $self.session.name.as_str(),
            "peer" => format!("{}", $self.session.peer_address),
            "state" => format!("{}", $self.fsm.state()),
            $($key => $value),*
        )
    };
    ($self:expr, $level:ident, $msg:expr, $($args:expr),*; $($key:expr => $value:expr),*) => {
        slog::$level!($self.log,
            $msg, $($args),*;
            "component" => crate::COMPONENT_BGP,
            "module" => crate::MOD_PEERING,
            "unit" => crate::UNIT_CONTROLLER,
            "peer_name" => $self.session.name.as_str(),
            "peer" => format!("{}", $self.session.peer_address),
            "state" => format!("{}", $self.fsm.state()),
            $($key => $value),*
        )
    };
    ($self:expr, $level:ident, $msg:expr) => {
        slog::$level!($self.log,
            $msg;
            "component" => crate::COMPONENT_BGP,
            "module" => crate::MOD_PEERING,
            "unit" => crate::UNIT_CONTROLLER,
            "peer_name" => $self.session.name.as_str(),
            "peer" => format!("{}", $self.session.peer_address),
            "state" => format!("{}", $self.fsm.state()),
        )
    };
    ($self:expr, $level:ident, $msg:expr, $($args:expr),*) => {
        slog::$level!($self.log,
            $msg, $($args),*;
            "component" => crate::COMPONENT_BGP,
            "module" => crate::MOD_PEERING,
            "unit" => crate::UNIT_CONTROLLER,
            "peer_name" => $self.session.name.as_str(),
            "peer" => format!("{}", $self.session.peer_address),
            "state" => format!("{}", $self.fsm.state()),
        )
    };
}

macro_rules! connection_log {
    ($self:expr, $level:ident, $msg:expr; $($key:expr => $value:expr),*) => {
        slog::$level!($self.log,
            $msg;
            "component" => crate::COMPONENT_BGP,
            "module" => crate::MOD_PEERING,
            "unit" => crate::UNIT_CONNECTION,
            "conn" => $self.id.0,
            "peer" => format!("{}", $self.peer),
            $($key => $value),*
        )
    };
    ($self:expr, $level:ident, $msg:expr, $($args:expr),*; $($key:expr => $value:expr),*) => {
        slog::$level!($self.log,
            $msg, $($args),*;
            "component" => crate::COMPONENT_BGP,
            "module" => crate::MOD_PEERING,
            "unit" => crate::UNIT_CONNECTION,
            "conn" => $self.id.0,
            "peer" => format!("{}", $self.peer),
            $($key => $value),*
        )
    };
    ($self:expr, $level:ident, $msg:expr) => {
        slog::$level!($self.log,
            $msg;
            "component" => crate::COMPONENT_BGP,
            "module" => crate::MOD_PEERING,
            "unit" => crate::UNIT_CONNECTION,
            "conn" => $self.id.0,
            "peer" => format!("{}", $self.peer),
        )
    };
    ($self:expr, $level:ident, $msg:expr, $($args:expr),*) => {
        slog::$level!($self.log,
            $msg, $($args),*;
            "component" => crate::COMPONENT_BGP,
            "module" => crate::MOD_PEERING,
            "unit" => crate::UNIT_CONNECTION,
            "conn" => $self.id.0,
            "peer" => format!("{}", $self.peer),
        )
    };
}

// connection_log variant used in functions that are not methods (no "self")
macro_rules! connection_log_lite {
    ($log:expr, $level:ident, $msg:expr; $($key:expr => $value:expr),*) => {
        slog::$level!($log,
            $msg;
            "component" => crate::COMPONENT_BGP,
            "module" => crate::MOD_PEERING,
            "unit" => crate::UNIT_CONNECTION,
            $($key => $value),*
        )
    };
    ($log:expr, $level:ident, $msg:expr, $($args:expr),*; $($key:expr => $value:expr),*) => {
        slog::$level!($log,
            $msg, $($args),*;
            "component" => crate::COMPONENT_BGP,
            "module" => crate::MOD_PEERING,
            "unit" => crate::UNIT_CONNECTION,
            $($key => $value),*
        )
    };
    ($log:expr, $level:ident, $msg:expr) => {
        slog::$level!($log,
            $msg;
            "component" => crate::COMPONENT_BGP,
            "module" => crate::MOD_PEERING,
            "unit" => crate::UNIT_CONNECTION,
        )
    };
    ($log:expr, $level:ident, $msg:expr, $($args:expr),*) => {
        slog::$level!($log,
            $msg, $($args),*;
            "component" => crate::COMPONENT_BGP,
            "module" => crate::MOD_PEERING,
            "unit" => crate::UNIT_CONNECTION,
        )
    };
}

pub(crate) use {connection_log, connection_log_lite, peering_log};
