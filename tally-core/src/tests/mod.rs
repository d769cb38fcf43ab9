pub mod fakes;

mod pipeline;
