pub mod queues;
pub mod run;
pub mod send;
pub mod showdown;
