//! Custom Resource Definitions for Drowse
//!
//! This module contains the GovernedService CRD and its supporting types.

mod governed_service;

pub use governed_service::{
    AutoscalerSpec, AutoscalerType, EnabledPeriod, GovernedService, GovernedServiceSpec,
    GovernedServiceStatus, Mode, ScaleTargetRef, ScaleTrigger, GOVERNED_SERVICE_FINALIZER,
};
