#![cfg_attr(not(test), no_std)]

pub mod adc_capture;
pub mod bias;
pub mod board;
pub mod front_end;
pub mod gain;
pub mod link;
pub mod sweep_timer;
