use std::path::Path;

use anyhow::{bail, ensure, Context, Result};
use bytes::Bytes;
use inferport_core::{
    AccelStrategy, Backend, BackendCapabilities, BackendModel, DType, IOName, LoadOptions,
    ModelSpec, Shape, Tensor, TensorSpec,
};
use ort::{
    execution_providers::ExecutionProviderDispatch,
    session::{
        builder::{GraphOptimizationLevel, SessionBuilder},
        Session, SessionInputValue,
    },
    tensor::TensorElementType,
    value::{DynValue, ValueType},
};
use tracing::debug;

#[derive(Clone, Copy, Debug)]
pub struct OrtBackend;

impl OrtBackend {
    pub fn new() -> Self {
        Self
    }
}

impl Default for OrtBackend {
    fn default() -> Self {
        Self::new()
    }
}

pub struct OrtModel {
    spec: ModelSpec,
    session: Option<Session>,
    input_names: Vec<String>,
}

impl Backend for OrtBackend {
    type Model = OrtModel;

    fn name(&self) -> &'static str {
        "onnxruntime"
    }

    fn capabilities(&self) -> BackendCapabilities {
        BackendCapabilities {
            gpu: cfg!(feature = "cuda"),
            accelerator: cfg!(all(feature = "nnapi", target_os = "android")),
        }
    }

    fn load(&self, model_path: &Path, opts: LoadOptions) -> Result<Self::Model> {
        let builder = Session::builder()
            .context("failed to create ORT session builder")?
            .with_optimization_level(GraphOptimizationLevel::Level3)
            .context("failed to configure ORT session builder")?
            .with_intra_threads(opts.cpu_threads.max(1))
            .context("failed to set ORT intra-op threads")?;

        let builder = configure_strategy(builder, opts)?;

        let session = builder
            .commit_from_file(model_path)
            .with_context(|| format!("failed to load ONNX model {}", model_path.display()))?;

        let input_names = session
            .inputs
            .iter()
            .map(|input| input.name.clone())
            .collect();
        let spec = build_model_spec(&session)?;

        debug!(
            path = %model_path.display(),
            strategy = %opts.strategy,
            threads = opts.cpu_threads,
            "ORT session ready"
        );
        Ok(OrtModel {
            spec,
            session: Some(session),
            input_names,
        })
    }
}

impl BackendModel for OrtModel {
    fn spec(&self) -> &ModelSpec {
        &self.spec
    }

    fn infer(&mut self, inputs: Vec<Tensor>) -> Result<Vec<Tensor>> {
        let Some(session) = self.session.as_mut() else {
            bail!("ORT session has been released");
        };
        ensure!(
            inputs.len() == self.input_names.len(),
            "expected {} inputs, got {}",
            self.input_names.len(),
            inputs.len()
        );

        let mut ort_inputs = Vec::with_capacity(inputs.len());
        for (name, input) in self.input_names.iter().zip(inputs) {
            ort_inputs.push((name.clone(), SessionInputValue::from(to_ort_value(input)?)));
        }

        let outputs = session.run(ort_inputs)?;
        let mut tensors = Vec::with_capacity(outputs.len());
        for (_, value) in outputs.iter() {
            tensors.push(from_ort_value(&value)?);
        }
        Ok(tensors)
    }

    fn release(&mut self) -> Result<()> {
        // Dropping the session frees its execution providers.
        self.session.take();
        Ok(())
    }
}

/// The optimized CPU provider is registered on every session; GPU and
/// accelerator providers go in front of it and must register or the load
/// fails, letting the caller fall back.
fn configure_strategy(builder: SessionBuilder, opts: LoadOptions) -> Result<SessionBuilder> {
    let mut providers: Vec<ExecutionProviderDispatch> = Vec::with_capacity(2);
    match opts.strategy {
        AccelStrategy::Cpu => {}
        AccelStrategy::Gpu => providers.push(cuda_provider()?),
        AccelStrategy::Accelerator => providers.push(nnapi_provider()?),
    }
    providers.extend(cpu_provider(opts.cpu_threads));

    if providers.is_empty() {
        return Ok(builder);
    }
    builder
        .with_execution_providers(providers)
        .with_context(|| format!("failed to enable ORT providers for {}", opts.strategy))
}

fn cpu_provider(threads: usize) -> Option<ExecutionProviderDispatch> {
    #[cfg(feature = "xnnpack")]
    {
        use ort::execution_providers::xnnpack::XNNPACKExecutionProvider;
        let ep = XNNPACKExecutionProvider::default();
        let ep = match std::num::NonZeroUsize::new(threads) {
            Some(n) => ep.with_intra_op_num_threads(n),
            None => ep,
        };
        Some(ep.build())
    }
    #[cfg(not(feature = "xnnpack"))]
    {
        let _ = threads;
        None
    }
}

fn cuda_provider() -> Result<ExecutionProviderDispatch> {
    #[cfg(feature = "cuda")]
    {
        use ort::execution_providers::cuda::CUDAExecutionProvider;
        Ok(CUDAExecutionProvider::default().build().error_on_failure())
    }
    #[cfg(not(feature = "cuda"))]
    {
        bail!("GPU requested but inferport-backend-ort was built without the `cuda` feature")
    }
}

fn nnapi_provider() -> Result<ExecutionProviderDispatch> {
    #[cfg(feature = "nnapi")]
    {
        use ort::execution_providers::nnapi::NNAPIExecutionProvider;
        Ok(NNAPIExecutionProvider::default()
            .with_fp16(true)
            .with_disable_cpu(true)
            .build()
            .error_on_failure())
    }
    #[cfg(not(feature = "nnapi"))]
    {
        bail!("accelerator requested but inferport-backend-ort was built without the `nnapi` feature")
    }
}

fn build_model_spec(session: &Session) -> Result<ModelSpec> {
    let inputs = session
        .inputs
        .iter()
        .map(|input| tensor_spec(&input.name, &input.input_type))
        .collect::<Result<Vec<_>>>()?;
    let outputs = session
        .outputs
        .iter()
        .map(|output| tensor_spec(&output.name, &output.output_type))
        .collect::<Result<Vec<_>>>()?;
    Ok(ModelSpec { inputs, outputs })
}

fn tensor_spec(name: &str, value_type: &ValueType) -> Result<TensorSpec> {
    let ValueType::Tensor { ty, shape, .. } = value_type else {
        bail!("model IO `{name}` is not a tensor");
    };
    Ok(TensorSpec {
        name: IOName(name.to_string()),
        dtype: element_dtype(*ty)?,
        dims: shape
            .iter()
            .map(|d| usize::try_from(*d).ok())
            .collect(),
    })
}

fn element_dtype(ty: TensorElementType) -> Result<DType> {
    match ty {
        TensorElementType::Float32 => Ok(DType::F32),
        TensorElementType::Uint8 => Ok(DType::U8),
        _ => bail!("unsupported tensor element type: {ty}"),
    }
}

fn to_ort_value(tensor: Tensor) -> Result<DynValue> {
    let shape: Vec<usize> = tensor.shape.dims().to_vec();
    let value = match tensor.dtype {
        DType::F32 => {
            let data = tensor.to_f32_vec()?;
            ort::value::Tensor::from_array((shape, data))?.into_dyn()
        }
        DType::U8 => ort::value::Tensor::from_array((shape, tensor.data.to_vec()))?.into_dyn(),
    };
    Ok(value)
}

fn from_ort_value(value: &ort::value::ValueRef<'_>) -> Result<Tensor> {
    let ValueType::Tensor { ty, shape, .. } = value.dtype() else {
        bail!("non-tensor outputs are not supported");
    };
    let dims: Vec<usize> = shape.iter().map(|d| (*d).max(0) as usize).collect();
    let shape = Shape::from_slice(&dims);

    match *ty {
        TensorElementType::Float32 => {
            let array = value.try_extract_array::<f32>()?;
            let values: Vec<f32> = array.iter().copied().collect();
            Tensor::from_f32(shape, &values)
        }
        TensorElementType::Uint8 => {
            let array = value.try_extract_array::<u8>()?;
            let data: Vec<u8> = array.iter().copied().collect();
            Tensor::from_bytes(DType::U8, shape, Bytes::from(data))
        }
        _ => bail!("unsupported output tensor element type: {ty}"),
    }
}
