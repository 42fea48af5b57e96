// CUDA Kernel Source Code: Compiled at device creation via NVRTC
//
// Every kernel works on column-major operands with an explicit leading
// dimension, so strided row slices go straight in without a contiguous copy.
// Element (r, c) of an operand lives at `ptr[c * ld + r]`; the caller has
// already advanced `ptr` to the view's offset.
//
// One thread per output element, flat index `idx = c * nrows + r`.
//
// Kernels with a variable number of operands (batch sum, sum of Hadamard
// products) read a table of 64-bit words from the device scratch buffer:
// pointers and leading dimensions packed side by side.
//
// GEMM and GEMV are cuBLAS calls, not kernels.

pub const MODULE_NAME: &str = "strand";

pub const KERNEL_SOURCE: &str = r#"

#define AT(p, ld, r, c) (p)[(size_t)(c) * (ld) + (r)]

#define ELEMENT_INDEX(nrows, ncols)                                   \
    size_t idx = (size_t)blockIdx.x * blockDim.x + threadIdx.x;      \
    if (idx >= (size_t)(nrows) * (ncols)) return;                     \
    int r = (int)(idx % (nrows));                                     \
    int c = (int)(idx / (nrows));

__device__ __forceinline__ float sigmoidf(float x) {
    return 1.0f / (1.0f + expf(-x));
}

//  FILL / COPY

extern "C" __global__ void fill_f32(float* dst, int ldd, int nrows, int ncols, float val) {
    ELEMENT_INDEX(nrows, ncols)
    AT(dst, ldd, r, c) = val;
}

extern "C" __global__ void fill_i32(int* dst, int ldd, int nrows, int ncols, int val) {
    ELEMENT_INDEX(nrows, ncols)
    AT(dst, ldd, r, c) = val;
}

extern "C" __global__ void copy_f32(const float* src, int lds, float* dst, int ldd,
                                    int nrows, int ncols) {
    ELEMENT_INDEX(nrows, ncols)
    AT(dst, ldd, r, c) = AT(src, lds, r, c);
}

extern "C" __global__ void copy_i32(const int* src, int lds, int* dst, int ldd,
                                    int nrows, int ncols) {
    ELEMENT_INDEX(nrows, ncols)
    AT(dst, ldd, r, c) = AT(src, lds, r, c);
}

//  LEVEL 1

extern "C" __global__ void scale_f32(float alpha, const float* src, int lds,
                                     float* dst, int ldd, int nrows, int ncols) {
    ELEMENT_INDEX(nrows, ncols)
    AT(dst, ldd, r, c) = alpha * AT(src, lds, r, c);
}

extern "C" __global__ void axpy_f32(float alpha, const float* x, int ldx,
                                    float* y, int ldy, int nrows, int ncols) {
    ELEMENT_INDEX(nrows, ncols)
    AT(y, ldy, r, c) += alpha * AT(x, ldx, r, c);
}

// table: [ptr_0 .. ptr_{count-1}, ld_0 .. ld_{count-1}]
extern "C" __global__ void batch_sum_f32(const unsigned long long* table, int count,
                                         float* dst, int ldd, int nrows, int ncols,
                                         int accumulate) {
    ELEMENT_INDEX(nrows, ncols)
    float acc = accumulate ? AT(dst, ldd, r, c) : 0.0f;
    for (int k = 0; k < count; ++k) {
        const float* p = (const float*)table[k];
        int ld = (int)table[count + k];
        acc += AT(p, ld, r, c);
    }
    AT(dst, ldd, r, c) = acc;
}

//  ACTIVATIONS
//
// kind: 0 = tanh, 1 = sigmoid, 2 = relu. `deriv` may be null.

__device__ __forceinline__ void activate(int kind, float x, float* y, float* dy) {
    if (kind == 0) {
        *y = tanhf(x);
        *dy = 1.0f - *y * *y;
    } else if (kind == 1) {
        *y = sigmoidf(x);
        *dy = *y * (1.0f - *y);
    } else {
        *y = x > 0.0f ? x : 0.0f;
        *dy = x > 0.0f ? 1.0f : 0.0f;
    }
}

extern "C" __global__ void activation_f32(int kind, const float* src, int lds,
                                          float* dst, int ldd, float* deriv, int lddv,
                                          int nrows, int ncols) {
    ELEMENT_INDEX(nrows, ncols)
    float y, dy;
    activate(kind, AT(src, lds, r, c), &y, &dy);
    AT(dst, ldd, r, c) = y;
    if (deriv) AT(deriv, lddv, r, c) = dy;
}

// tanh on the first quarter of rows (along_rows) or columns, sigmoid elsewhere.
extern "C" __global__ void tanh_sigmoid_f32(int along_rows, const float* src, int lds,
                                            float* dst, int ldd, float* deriv, int lddv,
                                            int nrows, int ncols) {
    ELEMENT_INDEX(nrows, ncols)
    int pos = along_rows ? r : c;
    int quarter = along_rows ? nrows / 4 : ncols / 4;
    float y, dy;
    activate(pos < quarter ? 0 : 1, AT(src, lds, r, c), &y, &dy);
    AT(dst, ldd, r, c) = y;
    if (deriv) AT(deriv, lddv, r, c) = dy;
}

//  HADAMARD PRODUCTS

// dst = a*b(*c) or dst = a*b(*c) + alpha*dst. `c` may be null.
extern "C" __global__ void hprod_f32(const float* a, int lda, const float* b, int ldb,
                                     const float* c3, int ldc, float* dst, int ldd,
                                     int nrows, int ncols, float alpha, int accumulate) {
    ELEMENT_INDEX(nrows, ncols)
    float v = AT(a, lda, r, c) * AT(b, ldb, r, c);
    if (c3) v *= AT(c3, ldc, r, c);
    if (accumulate) v += alpha * AT(dst, ldd, r, c);
    AT(dst, ldd, r, c) = v;
}

// Passed by value, mirrors `HprodTerms` on the host side.
struct HprodTerms {
    unsigned long long ptr[5][3];
    int ld[5][3];
    int nfactors[5];
};

extern "C" __global__ void sum_hprod_f32(HprodTerms terms, int nterms,
                                         float* dst, int ldd, int nrows, int ncols) {
    ELEMENT_INDEX(nrows, ncols)
    float acc = 0.0f;
    for (int t = 0; t < nterms; ++t) {
        float prod = 1.0f;
        for (int f = 0; f < terms.nfactors[t]; ++f) {
            const float* p = (const float*)terms.ptr[t][f];
            prod *= AT(p, terms.ld[t][f], r, c);
        }
        acc += prod;
    }
    AT(dst, ldd, r, c) = acc;
}

// dst[r] = sum_j a[r, j] * b[r, j]; one thread per row.
extern "C" __global__ void hprod_sum_f32(const float* a, int lda, const float* b, int ldb,
                                         float* dst, int nrows, int ncols) {
    int r = blockIdx.x * blockDim.x + threadIdx.x;
    if (r >= nrows) return;
    float acc = 0.0f;
    for (int j = 0; j < ncols; ++j) {
        acc += AT(a, lda, r, j) * AT(b, ldb, r, j);
    }
    dst[r] = acc;
}

extern "C" __global__ void cross_entropy_f32(const float* p, int ldp, const float* q, int ldq,
                                             float* dst, int ldd, int nrows, int ncols) {
    ELEMENT_INDEX(nrows, ncols)
    float pv = AT(p, ldp, r, c);
    float qv = AT(q, ldq, r, c);
    AT(dst, ldd, r, c) = -(pv * logf(qv) + (1.0f - pv) * logf(1.0f - qv));
}

//  COLUMN GATHER / SCATTER

// dst[:, j] = src[:, idx[j]] (or idx[ncols - 1 - j] when reverse)
extern "C" __global__ void slice_columns_f32(const float* src, int lds,
                                             const int* idx, int idx_stride,
                                             float* dst, int ldd, int nrows, int ncols,
                                             int reverse) {
    ELEMENT_INDEX(nrows, ncols)
    int k = reverse ? ncols - 1 - c : c;
    int col = idx[(size_t)k * idx_stride];
    AT(dst, ldd, r, c) = AT(src, lds, r, col);
}

// dst[:, idx[j]] += alpha * src[:, j]; repeated indices accumulate.
extern "C" __global__ void add_scaled_at_columns_f32(const int* idx, int idx_stride, float alpha,
                                                     const float* src, int lds,
                                                     float* dst, int ldd, int nrows, int ncols) {
    ELEMENT_INDEX(nrows, ncols)
    int col = idx[(size_t)c * idx_stride];
    atomicAdd(&AT(dst, ldd, r, col), alpha * AT(src, lds, r, c));
}

"#;

pub const KERNEL_NAMES: &[&str] = &[
    "fill_f32",
    "fill_i32",
    "copy_f32",
    "copy_i32",
    "scale_f32",
    "axpy_f32",
    "batch_sum_f32",
    "activation_f32",
    "tanh_sigmoid_f32",
    "hprod_f32",
    "sum_hprod_f32",
    "hprod_sum_f32",
    "cross_entropy_f32",
    "slice_columns_f32",
    "add_scaled_at_columns_f32",
];
